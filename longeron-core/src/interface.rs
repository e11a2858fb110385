//! The interface: a pool of worker threads, each driving one reactor or
//! proactor and its chronology.
//!
//! Socket creation routes to a worker by a placement policy; with dynamic
//! load balancing enabled, sockets migrate off overloaded workers, and
//! with thread scaling enabled the pool grows toward `max_threads` under
//! sustained load and shrinks back to `min_threads` when idle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::chronology::{Chronology, Timer, TimerEvent, TimerOptions};
use crate::datagram::DatagramSocket;
use crate::error::{Error, ErrorKind, Result};
use crate::listener::ListenerSocket;
use crate::option::{DatagramSocketOptions, ListenerSocketOptions, StreamSocketOptions};
use crate::plugin;
use crate::proactor::Proactor;
use crate::reactor::Reactor;
use crate::resolver::Resolver;
use crate::stream::{StreamShared, StreamSocket};

/// How socket creation chooses its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPlacement {
    /// The worker with the minimum load score.
    LeastBusy,
    /// Rotate across workers.
    RoundRobin,
    /// A fixed worker by index.
    ThreadIndex(usize),
}

/// Which demultiplexer kind the pool's workers drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemultiplexerKind {
    /// Readiness-based workers; each owns one [`Reactor`].
    Reactor,
    /// Completion-based workers; each owns one [`Proactor`].
    Proactor,
}

/// Configuration of an interface.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Prefix of the worker thread names.
    pub thread_name: String,
    /// Workers started eagerly and kept through idle periods.
    pub min_threads: usize,
    /// Upper bound on workers under thread scaling.
    pub max_threads: usize,
    /// The placement policy.
    pub placement: SocketPlacement,
    /// Whether workers drive reactors or proactors.
    pub demultiplexer: DemultiplexerKind,
    /// Migrate sockets off overloaded workers.
    pub dynamic_load_balancing: bool,
    /// Grow and shrink the pool between `min_threads` and `max_threads`.
    pub thread_scaling: bool,
    /// The readiness backend, by registered name.
    pub backend_name: String,
    /// The completion backend, by registered name.
    pub proactor_backend_name: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            thread_name: "longeron".to_string(),
            min_threads: 1,
            max_threads: num_cpus::get().max(1),
            placement: SocketPlacement::LeastBusy,
            demultiplexer: DemultiplexerKind::Reactor,
            dynamic_load_balancing: false,
            thread_scaling: false,
            backend_name: "system".to_string(),
            proactor_backend_name: "synchronous".to_string(),
        }
    }
}

impl InterfaceConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the worker count bounds.
    #[must_use]
    pub fn with_threads(mut self, min_threads: usize, max_threads: usize) -> Self {
        self.min_threads = min_threads.max(1);
        self.max_threads = max_threads.max(self.min_threads);
        self
    }

    /// Set the placement policy.
    #[must_use]
    pub fn with_placement(mut self, placement: SocketPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Drive the pool's workers with the given demultiplexer kind.
    #[must_use]
    pub fn with_demultiplexer(mut self, demultiplexer: DemultiplexerKind) -> Self {
        self.demultiplexer = demultiplexer;
        self
    }

    /// Migrate sockets off overloaded workers.
    #[must_use]
    pub fn with_dynamic_load_balancing(mut self, enabled: bool) -> Self {
        self.dynamic_load_balancing = enabled;
        self
    }

    /// Grow and shrink the pool with load.
    #[must_use]
    pub fn with_thread_scaling(mut self, enabled: bool) -> Self {
        self.thread_scaling = enabled;
        self
    }
}

/// How often the balancer re-evaluates worker load.
const REBALANCE_INTERVAL: Duration = Duration::from_secs(1);
/// A worker this far above the least-busy one sheds a socket.
const MIGRATION_HYSTERESIS: usize = 8;
/// Average load per worker above which the pool grows.
const SCALE_UP_LOAD: usize = 64;

/// The demultiplexer a worker thread drives.
#[derive(Clone)]
enum Driver {
    Reactor(Arc<Reactor>),
    Proactor(Arc<Proactor>),
}

impl Driver {
    fn load(&self) -> usize {
        match self {
            Self::Reactor(reactor) => reactor.load(),
            Self::Proactor(proactor) => proactor.load(),
        }
    }

    fn num_sockets(&self) -> usize {
        match self {
            Self::Reactor(reactor) => reactor.num_sockets(),
            Self::Proactor(proactor) => proactor.num_sockets(),
        }
    }

    fn chronology(&self) -> &Arc<Chronology> {
        match self {
            Self::Reactor(reactor) => reactor.chronology(),
            Self::Proactor(proactor) => proactor.chronology(),
        }
    }

    fn run(&self) {
        match self {
            Self::Reactor(reactor) => reactor.run(),
            Self::Proactor(proactor) => proactor.run(),
        }
    }

    fn stop(&self) {
        match self {
            Self::Reactor(reactor) => reactor.stop(),
            Self::Proactor(proactor) => proactor.stop(),
        }
    }

    fn reactor(&self) -> Option<&Arc<Reactor>> {
        match self {
            Self::Reactor(reactor) => Some(reactor),
            Self::Proactor(_) => None,
        }
    }

    fn proactor(&self) -> Option<&Arc<Proactor>> {
        match self {
            Self::Reactor(_) => None,
            Self::Proactor(proactor) => Some(proactor),
        }
    }
}

struct Worker {
    index: usize,
    driver: Driver,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A pool of worker threads driving reactors or proactors, with socket
/// placement and lifecycle management.
pub struct Interface {
    config: InterfaceConfig,
    resolver: Arc<Resolver>,
    workers: Mutex<Vec<Arc<Worker>>>,
    sockets: Mutex<Vec<Weak<StreamShared>>>,
    round_robin: AtomicUsize,
    next_worker_index: AtomicUsize,
    running: AtomicBool,
    balance_timer: Mutex<Option<Arc<Timer>>>,
}

impl Interface {
    /// Create an interface with its own resolver.
    pub fn new(config: InterfaceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver: Resolver::new(),
            workers: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            next_worker_index: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            balance_timer: Mutex::new(None),
        })
    }

    /// The interface's resolver.
    #[must_use]
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// The number of running workers.
    pub fn num_threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Spawn the minimum worker set and, when configured, the balancer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::Invalid));
        }
        plugin::initialize();
        for _ in 0..self.config.min_threads {
            self.add_worker()?;
        }
        let backend = match self.config.demultiplexer {
            DemultiplexerKind::Reactor => &self.config.backend_name,
            DemultiplexerKind::Proactor => &self.config.proactor_backend_name,
        };
        info!(
            threads = self.config.min_threads,
            %backend,
            kind = ?self.config.demultiplexer,
            "interface started"
        );

        if self.config.dynamic_load_balancing || self.config.thread_scaling {
            self.schedule_balancer();
        }
        Ok(())
    }

    /// Request shutdown without waiting for the workers to exit.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.balance_timer.lock().take() {
            timer.cancel();
        }
        for worker in self.workers.lock().iter() {
            worker.driver.stop();
        }
    }

    /// Wait for every worker thread to exit.
    pub fn linger(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Some(thread) = worker.thread.lock().take() {
                thread.join().ok();
            }
        }
    }

    /// Shut down and wait.
    pub fn stop(&self) {
        self.shutdown();
        self.linger();
    }

    /// Create a stream socket placed per the configured policy. The
    /// shipped sockets are readiness-driven, so the pool must contain
    /// reactor workers.
    pub fn create_stream_socket(&self, options: StreamSocketOptions) -> Result<StreamSocket> {
        let reactor = self.pick_reactor()?;
        let socket = StreamSocket::new(&reactor, Arc::clone(&self.resolver), options);
        let mut sockets = self.sockets.lock();
        sockets.retain(|weak| weak.strong_count() > 0);
        sockets.push(Arc::downgrade(socket.shared()));
        Ok(socket)
    }

    /// Create a listener whose accepted children are placed per the
    /// configured policy.
    pub fn create_listener_socket(
        self: &Arc<Self>,
        options: ListenerSocketOptions,
    ) -> Result<ListenerSocket> {
        let reactor = self.pick_reactor()?;
        let listener = ListenerSocket::new(&reactor, Arc::clone(&self.resolver), options);

        let weak = Arc::downgrade(self);
        listener.set_child_placement(Arc::new(move || {
            weak.upgrade()
                .and_then(|interface| interface.pick_reactor().ok())
        }));
        Ok(listener)
    }

    /// Create a datagram socket placed per the configured policy.
    pub fn create_datagram_socket(&self, options: DatagramSocketOptions) -> Result<DatagramSocket> {
        let reactor = self.pick_reactor()?;
        Ok(DatagramSocket::new(&reactor, options))
    }

    /// The reactor of the worker the placement policy selects; fails with
    /// `NotImplemented` when the pool drives proactors.
    pub fn pick_reactor(&self) -> Result<Arc<Reactor>> {
        self.pick_driver(Driver::reactor)
    }

    /// The proactor of the worker the placement policy selects; fails with
    /// `NotImplemented` when the pool drives reactors.
    pub fn pick_proactor(&self) -> Result<Arc<Proactor>> {
        self.pick_driver(Driver::proactor)
    }

    fn pick_driver<T>(&self, project: impl Fn(&Driver) -> Option<&Arc<T>>) -> Result<Arc<T>> {
        let workers = self.workers.lock();
        if workers.is_empty() {
            return Err(Error::new(ErrorKind::Invalid));
        }

        if let SocketPlacement::ThreadIndex(index) = self.config.placement {
            let worker = workers.get(index).ok_or(Error::new(ErrorKind::Invalid))?;
            return project(&worker.driver)
                .cloned()
                .ok_or(Error::new(ErrorKind::NotImplemented));
        }

        let eligible: Vec<&Arc<Worker>> = workers
            .iter()
            .filter(|worker| project(&worker.driver).is_some())
            .collect();
        if eligible.is_empty() {
            return Err(Error::new(ErrorKind::NotImplemented));
        }

        let worker = match self.config.placement {
            SocketPlacement::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                eligible[index % eligible.len()]
            }
            SocketPlacement::LeastBusy => eligible
                .iter()
                .min_by_key(|worker| worker.driver.load())
                .unwrap(),
            SocketPlacement::ThreadIndex(_) => unreachable!("handled above"),
        };
        project(&worker.driver)
            .cloned()
            .ok_or(Error::new(ErrorKind::NotImplemented))
    }

    fn add_worker(self: &Arc<Self>) -> Result<()> {
        let index = self.next_worker_index.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{index}", self.config.thread_name);

        let driver = match self.config.demultiplexer {
            DemultiplexerKind::Reactor => {
                let backend = plugin::create_poll_backend(&self.config.backend_name)?;
                Driver::Reactor(Reactor::with_backend(name.clone(), backend))
            }
            DemultiplexerKind::Proactor => {
                let backend =
                    plugin::create_proactor_backend(&self.config.proactor_backend_name)?;
                Driver::Proactor(Proactor::with_backend(name.clone(), backend))
            }
        };

        let thread_driver = driver.clone();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || thread_driver.run())
            .map_err(Error::from)?;

        self.workers.lock().push(Arc::new(Worker {
            index,
            driver,
            thread: Mutex::new(Some(thread)),
        }));
        Ok(())
    }

    fn schedule_balancer(self: &Arc<Self>) {
        let Some(worker) = self.workers.lock().first().cloned() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timer = worker.driver.chronology().create_timer(
            TimerOptions::default(),
            Arc::new(move |_, event| {
                if event == TimerEvent::Deadline {
                    if let Some(interface) = weak.upgrade() {
                        interface.rebalance();
                    }
                }
            }),
        );
        timer.schedule(Instant::now() + REBALANCE_INTERVAL, Some(REBALANCE_INTERVAL));
        *self.balance_timer.lock() = Some(timer);
    }

    /// One balancer pass: scale the pool, then shed load off the busiest
    /// worker.
    fn rebalance(self: &Arc<Self>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        if self.config.thread_scaling {
            self.scale_pool();
        }
        if self.config.dynamic_load_balancing {
            self.migrate_one();
        }
    }

    fn scale_pool(self: &Arc<Self>) {
        let (total_load, count, idle) = {
            let workers = self.workers.lock();
            let total: usize = workers.iter().map(|worker| worker.driver.load()).sum();
            // The first worker hosts the balancer timer and is never
            // retired.
            let idle = workers
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, worker)| worker.driver.num_sockets() == 0)
                .map(|(index, _)| index);
            (total, workers.len(), idle)
        };
        if count == 0 {
            return;
        }
        let average = total_load / count;

        if average > SCALE_UP_LOAD && count < self.config.max_threads {
            debug!(average, count, "scaling up");
            if let Err(error) = self.add_worker() {
                warn!(%error, "scale-up failed");
            }
        } else if average == 0 && count > self.config.min_threads {
            if let Some(index) = idle {
                let worker = self.workers.lock().remove(index);
                debug!(worker = worker.index, "retiring idle worker");
                worker.driver.stop();
                if let Some(thread) = worker.thread.lock().take() {
                    thread.join().ok();
                };
            }
        }
    }

    /// Migration moves readiness-driven sockets, so only reactor workers
    /// participate.
    fn migrate_one(self: &Arc<Self>) {
        let (busiest, least) = {
            let workers = self.workers.lock();
            let mut reactors = workers
                .iter()
                .filter_map(|worker| worker.driver.reactor().cloned())
                .collect::<Vec<_>>();
            if reactors.len() < 2 {
                return;
            }
            reactors.sort_by_key(|reactor| reactor.load());
            let least = reactors.first().unwrap().clone();
            let busiest = reactors.last().unwrap().clone();
            (busiest, least)
        };

        if busiest.load() < least.load() + MIGRATION_HYSTERESIS {
            return;
        }

        let candidate = {
            let mut sockets = self.sockets.lock();
            sockets.retain(|weak| weak.strong_count() > 0);
            sockets
                .iter()
                .filter_map(Weak::upgrade)
                .find(|shared| {
                    shared
                        .current_reactor()
                        .is_some_and(|reactor| Arc::ptr_eq(&reactor, &busiest))
                })
        };
        if let Some(shared) = candidate {
            debug!(from = busiest.name(), to = least.name(), "migrating socket");
            if let Err(error) = shared.migrate_to(&least) {
                debug!(%error, "migration skipped");
            }
        }
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.shutdown();
        self.linger();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop() {
        let interface = Interface::new(
            InterfaceConfig::new()
                .with_thread_name("test-pool")
                .with_threads(2, 2),
        );
        interface.start().unwrap();
        assert_eq!(interface.num_threads(), 2);
        assert!(interface.start().is_err());
        interface.stop();
        assert_eq!(interface.num_threads(), 0);
    }

    #[test]
    fn placement_round_robin_rotates() {
        let interface = Interface::new(
            InterfaceConfig::new()
                .with_threads(2, 2)
                .with_placement(SocketPlacement::RoundRobin),
        );
        interface.start().unwrap();

        let first = interface.pick_reactor().unwrap();
        let second = interface.pick_reactor().unwrap();
        let third = interface.pick_reactor().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));

        interface.stop();
    }

    #[test]
    fn placement_thread_index_is_stable() {
        let interface = Interface::new(
            InterfaceConfig::new()
                .with_threads(2, 2)
                .with_placement(SocketPlacement::ThreadIndex(1)),
        );
        interface.start().unwrap();

        let first = interface.pick_reactor().unwrap();
        let second = interface.pick_reactor().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let invalid = Interface::new(
            InterfaceConfig::new()
                .with_threads(1, 1)
                .with_placement(SocketPlacement::ThreadIndex(7)),
        );
        invalid.start().unwrap();
        assert!(invalid.pick_reactor().is_err());

        interface.stop();
        invalid.stop();
    }

    #[test]
    fn sockets_created_before_start_fail() {
        let interface = Interface::new(InterfaceConfig::new());
        assert!(interface
            .create_stream_socket(StreamSocketOptions::default())
            .is_err());
    }

    #[test]
    fn proactor_pool_starts_and_places() {
        let interface = Interface::new(
            InterfaceConfig::new()
                .with_thread_name("completion-pool")
                .with_threads(2, 2)
                .with_demultiplexer(DemultiplexerKind::Proactor),
        );
        interface.start().unwrap();
        assert_eq!(interface.num_threads(), 2);

        // Placement selects a proactor; readiness-driven socket creation
        // has no worker to land on.
        let proactor = interface.pick_proactor().unwrap();
        assert!(proactor.name().starts_with("completion-pool"));
        assert_eq!(
            interface.pick_reactor().unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
        assert_eq!(
            interface
                .create_stream_socket(StreamSocketOptions::default())
                .unwrap_err()
                .kind(),
            ErrorKind::NotImplemented
        );

        interface.stop();
    }

    #[test]
    fn reactor_pool_has_no_proactor() {
        let interface = Interface::new(InterfaceConfig::new().with_threads(1, 1));
        interface.start().unwrap();
        assert_eq!(
            interface.pick_proactor().unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
        interface.stop();
    }
}
