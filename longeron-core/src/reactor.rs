//! The readiness-based demultiplexer engine.
//!
//! A [`Reactor`] drives one polling backend, one [`Chronology`], and the
//! registry of attached handles. The only blocking call in the engine is
//! the backend's `wait`; everything else is non-blocking. Sockets attach
//! with either a session (socket-scoped registration) or individual
//! per-condition callbacks (handle-only registration), and detach through
//! the reference-counted detach protocol so no event is ever delivered to
//! a torn-down socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::chronology::{Chronology, Job};
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{
    DetachProgress, EntryCondition, EntrySinks, EventCallback, InterestSet, ReactorEvent,
    ReactorSocket, RegistryEntry,
};
use crate::strand::Executor;

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// The registry token reserved for the backend's waker.
pub const WAKER_TOKEN: usize = 0;

/// The longest a `wait` may block before re-checking for shutdown.
const MAX_WAIT: Duration = Duration::from_millis(250);

/// One readiness report from a polling backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollEvent {
    /// The registry token the report belongs to.
    pub token: usize,
    /// The handle is readable.
    pub readable: bool,
    /// The handle is writable.
    pub writable: bool,
    /// The handle reported an error condition.
    pub error: bool,
    /// The peer shut down its sending side.
    pub read_closed: bool,
}

/// One OS polling mechanism behind the reactor.
pub trait PollBackend: Send + Sync {
    /// The backend's name, as registered with the driver registry.
    fn name(&self) -> &'static str;

    /// Register `handle` under `token` for the given interest.
    #[cfg(unix)]
    fn register(&self, handle: RawFd, token: usize, interest: InterestSet) -> Result<()>;

    /// Change the interest of an already-registered handle.
    #[cfg(unix)]
    fn reregister(&self, handle: RawFd, token: usize, interest: InterestSet) -> Result<()>;

    /// Remove `handle` from the poll set.
    #[cfg(unix)]
    fn deregister(&self, handle: RawFd) -> Result<()>;

    /// Block up to `timeout` for readiness reports, appending them to
    /// `events`.
    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<()>;

    /// Interrupt a concurrent `wait`.
    fn wake(&self) -> Result<()>;
}

/// The mio-backed backend: epoll, kqueue, or the platform equivalent.
#[cfg(unix)]
pub struct SystemBackend {
    poll: Mutex<PollState>,
    registry: mio::Registry,
    waker: mio::Waker,
}

#[cfg(unix)]
struct PollState {
    poll: mio::Poll,
    events: mio::Events,
}

#[cfg(unix)]
impl SystemBackend {
    /// Create a backend over the platform's preferred polling mechanism.
    pub fn new() -> Result<Self> {
        let poll = mio::Poll::new().map_err(Error::from)?;
        let registry = poll.registry().try_clone().map_err(Error::from)?;
        let waker =
            mio::Waker::new(poll.registry(), mio::Token(WAKER_TOKEN)).map_err(Error::from)?;
        Ok(Self {
            poll: Mutex::new(PollState {
                poll,
                events: mio::Events::with_capacity(1024),
            }),
            registry,
            waker,
        })
    }

    fn mio_interest(interest: InterestSet) -> Option<mio::Interest> {
        match (interest.want_readable, interest.want_writable) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            // Notification-only interest still polls for readability of the
            // error queue, reported through the error flag.
            (false, false) if interest.want_notifications => Some(mio::Interest::READABLE),
            (false, false) => None,
        }
    }
}

#[cfg(unix)]
impl PollBackend for SystemBackend {
    fn name(&self) -> &'static str {
        "system"
    }

    fn register(&self, handle: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        let interest = Self::mio_interest(interest).ok_or(Error::new(ErrorKind::Invalid))?;
        self.registry
            .register(&mut mio::unix::SourceFd(&handle), mio::Token(token), interest)
            .map_err(Error::from)
    }

    fn reregister(&self, handle: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        let interest = Self::mio_interest(interest).ok_or(Error::new(ErrorKind::Invalid))?;
        self.registry
            .reregister(&mut mio::unix::SourceFd(&handle), mio::Token(token), interest)
            .map_err(Error::from)
    }

    fn deregister(&self, handle: RawFd) -> Result<()> {
        self.registry
            .deregister(&mut mio::unix::SourceFd(&handle))
            .map_err(Error::from)
    }

    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.poll.lock();
        let state = &mut *state;
        match state.poll.poll(&mut state.events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(error) => return Err(Error::from(error)),
        }
        for event in state.events.iter() {
            events.push(PollEvent {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                read_closed: event.is_read_closed(),
            });
        }
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        self.waker.wake().map_err(Error::from)
    }
}

struct Registration {
    entry: Arc<RegistryEntry>,
    polled: bool,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").field("name", &self.name).finish()
    }
}

/// A readiness-based demultiplexer bound to one worker.
pub struct Reactor {
    name: String,
    backend: Box<dyn PollBackend>,
    chronology: Arc<Chronology>,
    catalog: Mutex<HashMap<usize, Registration>>,
    next_token: AtomicUsize,
    running: AtomicBool,
}

impl Reactor {
    /// Create a reactor over `backend`.
    pub fn with_backend(name: impl Into<String>, backend: Box<dyn PollBackend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backend,
            chronology: Chronology::new(),
            catalog: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKER_TOKEN + 1),
            running: AtomicBool::new(false),
        })
    }

    /// Create a reactor over the platform's preferred backend.
    #[cfg(unix)]
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        Ok(Self::with_backend(name, Box::new(SystemBackend::new()?)))
    }

    /// The reactor's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chronology owned by this reactor's worker.
    #[must_use]
    pub fn chronology(&self) -> &Arc<Chronology> {
        &self.chronology
    }

    /// The number of attached handles.
    #[must_use]
    pub fn num_sockets(&self) -> usize {
        self.catalog.lock().len()
    }

    /// The load score used by placement policies.
    #[must_use]
    pub fn load(&self) -> usize {
        // Sockets dominate timers in the score.
        4 * self.num_sockets() + self.chronology.num_scheduled()
    }

    /// Attach a socket session for `handle` with the given initial
    /// interest.
    #[cfg(unix)]
    pub fn attach_socket(
        &self,
        handle: RawFd,
        interest: InterestSet,
        socket: Arc<dyn ReactorSocket>,
    ) -> Result<Arc<RegistryEntry>> {
        self.attach(
            handle,
            interest,
            EntrySinks {
                socket: Some(socket),
                ..EntrySinks::default()
            },
        )
    }

    /// Attach per-condition callbacks for `handle` with the given initial
    /// interest.
    #[cfg(unix)]
    pub fn attach_handle(
        &self,
        handle: RawFd,
        interest: InterestSet,
        readable: Option<EventCallback>,
        writable: Option<EventCallback>,
        error: Option<EventCallback>,
    ) -> Result<Arc<RegistryEntry>> {
        self.attach(
            handle,
            interest,
            EntrySinks {
                socket: None,
                readable,
                writable,
                error,
            },
        )
    }

    #[cfg(unix)]
    fn attach(
        &self,
        handle: RawFd,
        interest: InterestSet,
        sinks: EntrySinks,
    ) -> Result<Arc<RegistryEntry>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(RegistryEntry::new(token, handle, interest, sinks));

        let mut catalog = self.catalog.lock();
        let polled = if SystemBackend::mio_interest(interest).is_some() {
            self.backend.register(handle, token, interest)?;
            true
        } else {
            false
        };
        catalog.insert(
            token,
            Registration {
                entry: Arc::clone(&entry),
                polled,
            },
        );
        trace!(reactor = %self.name, token, handle, "attach");
        Ok(entry)
    }

    /// Request detachment of `entry`. The entry's detach callback runs on
    /// this reactor's worker exactly once, after in-flight deliveries
    /// drain.
    pub fn detach(&self, entry: &Arc<RegistryEntry>) -> Result<()> {
        match entry.detach_context().detach() {
            Ok(DetachProgress::Complete) => {
                self.complete_detach(entry);
                Ok(())
            }
            Ok(DetachProgress::Pending) => {
                // The dispatching thread that releases the last reference
                // completes the detach.
                self.backend.wake().ok();
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::Pending => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn complete_detach(&self, entry: &Arc<RegistryEntry>) {
        {
            let mut catalog = self.catalog.lock();
            if let Some(registration) = catalog.remove(&entry.token()) {
                #[cfg(unix)]
                if registration.polled {
                    if let Err(error) = self.backend.deregister(entry.handle()) {
                        debug!(reactor = %self.name, token = entry.token(), %error, "deregister");
                    }
                }
            }
        }
        trace!(reactor = %self.name, token = entry.token(), "detached");
        if let Some(callback) = entry.take_detach_callback() {
            self.chronology.execute(callback);
            self.backend.wake().ok();
        }
        entry.clear_sinks();
    }

    /// Update the interest of `entry` and synchronize the poll set.
    pub fn modify_interest(
        &self,
        entry: &Arc<RegistryEntry>,
        update: impl FnOnce(&mut InterestSet),
    ) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let registration = catalog
            .get_mut(&entry.token())
            .ok_or(Error::new(ErrorKind::Invalid))?;
        let interest = entry.update_interest(update);

        #[cfg(unix)]
        {
            let handle = entry.handle();
            let wants_poll = SystemBackend::mio_interest(interest).is_some();
            match (registration.polled, wants_poll) {
                (false, true) => {
                    self.backend.register(handle, entry.token(), interest)?;
                    registration.polled = true;
                }
                (true, true) => {
                    self.backend.reregister(handle, entry.token(), interest)?;
                }
                (true, false) => {
                    self.backend.deregister(handle)?;
                    registration.polled = false;
                }
                (false, false) => {}
            }
        }
        Ok(())
    }

    /// Begin polling for readability of `entry`.
    pub fn show_readable(&self, entry: &Arc<RegistryEntry>) -> Result<()> {
        self.modify_interest(entry, |interest| interest.want_readable = true)
    }

    /// Stop polling for readability of `entry`.
    pub fn hide_readable(&self, entry: &Arc<RegistryEntry>) -> Result<()> {
        self.modify_interest(entry, |interest| interest.want_readable = false)
    }

    /// Begin polling for writability of `entry`.
    pub fn show_writable(&self, entry: &Arc<RegistryEntry>) -> Result<()> {
        self.modify_interest(entry, |interest| interest.want_writable = true)
    }

    /// Stop polling for writability of `entry`.
    pub fn hide_writable(&self, entry: &Arc<RegistryEntry>) -> Result<()> {
        self.modify_interest(entry, |interest| interest.want_writable = false)
    }

    /// Run one demultiplexing cycle: wait up to the earliest deadline (or
    /// `cap`), dispatch readiness, then announce due timers and deferred
    /// functions. Returns the number of readiness reports dispatched.
    pub fn drive(&self, cap: Option<Duration>) -> Result<usize> {
        let now = Instant::now();
        let mut timeout = self
            .chronology
            .timeout_interval(now)
            .map_or(MAX_WAIT, |interval| interval.min(MAX_WAIT));
        if let Some(cap) = cap {
            timeout = timeout.min(cap);
        }
        if self.chronology.num_deferred() > 0 {
            timeout = Duration::ZERO;
        }

        let mut events = Vec::new();
        self.backend.wait(&mut events, Some(timeout))?;

        let mut dispatched = 0;
        for event in &events {
            if event.token == WAKER_TOKEN {
                continue;
            }
            dispatched += 1;
            self.dispatch(event);
        }

        self.chronology.announce(Instant::now(), false);
        Ok(dispatched)
    }

    /// Run demultiplexing cycles until [`stop`](Self::stop) is called.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        debug!(reactor = %self.name, "running");
        while self.running.load(Ordering::Acquire) {
            if let Err(error) = self.drive(None) {
                warn!(reactor = %self.name, %error, "drive failed");
                break;
            }
        }
        debug!(reactor = %self.name, "stopped");
    }

    /// Request that [`run`](Self::run) return after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.backend.wake().ok();
    }

    fn dispatch(&self, event: &PollEvent) {
        let entry = {
            let catalog = self.catalog.lock();
            match catalog.get(&event.token) {
                Some(registration) => Arc::clone(&registration.entry),
                None => return,
            }
        };

        // Acquire a delivery reference; failure means the socket is tearing
        // down and the event is discarded.
        if !entry.detach_context().increment_reference() {
            return;
        }

        let interest = entry.interest();
        let readable = (event.readable || event.read_closed) && interest.want_readable;
        let writable = event.writable && interest.want_writable;

        // One-shot registrations hide the delivered conditions before
        // dispatch; callbacks re-arm explicitly.
        if interest.one_shot && (readable || writable) {
            let result = self.modify_interest(&entry, |interest| {
                if readable {
                    interest.want_readable = false;
                }
                if writable {
                    interest.want_writable = false;
                }
            });
            if let Err(error) = result {
                debug!(reactor = %self.name, token = event.token, %error, "one-shot disarm");
            }
        }

        if let Some(socket) = entry.socket() {
            if event.error {
                if interest.want_notifications {
                    socket.process_notifications();
                } else {
                    socket.process_error(Error::new(ErrorKind::Other));
                }
            }
            if readable {
                socket.process_readable();
            }
            if writable {
                socket.process_writable();
            }
        } else {
            self.dispatch_handle_callbacks(&entry, event, readable, writable);
        }

        if entry.detach_context().decrement_reference() {
            self.complete_detach(&entry);
        }
    }

    // Error folding for handle-only registrations: an error with no error
    // callback is delivered through the readable callback, else the
    // writable callback, with the error field populated.
    fn dispatch_handle_callbacks(
        &self,
        entry: &Arc<RegistryEntry>,
        event: &PollEvent,
        readable: bool,
        writable: bool,
    ) {
        let error = event.error.then(|| Error::new(ErrorKind::Other));

        let reactor_event = ReactorEvent {
            token: event.token,
            readable,
            writable,
            error,
        };

        let folded = if event.error {
            entry
                .callback(EntryCondition::Error)
                .or_else(|| entry.callback(EntryCondition::Readable))
                .or_else(|| entry.callback(EntryCondition::Writable))
        } else {
            None
        };
        if let Some(callback) = &folded {
            callback(&reactor_event);
        }

        // A callback that already received the folded error is not invoked
        // again for the same report.
        if readable {
            if let Some(callback) = entry.callback(EntryCondition::Readable) {
                if !folded
                    .as_ref()
                    .is_some_and(|target| Arc::ptr_eq(target, &callback))
                {
                    callback(&reactor_event);
                }
            }
        }
        if writable {
            if let Some(callback) = entry.callback(EntryCondition::Writable) {
                if !folded
                    .as_ref()
                    .is_some_and(|target| Arc::ptr_eq(target, &callback))
                {
                    callback(&reactor_event);
                }
            }
        }
    }
}

impl Executor for Reactor {
    fn execute(&self, job: Job) {
        self.chronology.execute(job);
        self.backend.wake().ok();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::syscall::{self, Transport};
    use std::net::Ipv4Addr;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;

    fn drive_until(reactor: &Reactor, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "reactor did not converge");
            reactor.drive(Some(Duration::from_millis(10))).unwrap();
        }
    }

    #[test]
    fn reports_listener_readable_on_connect() {
        let reactor = Reactor::new("test").unwrap();

        let listener = syscall::create(Transport::TcpIpv4Stream).unwrap();
        syscall::bind(&listener, &Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0), true).unwrap();
        syscall::listen(&listener, 8).unwrap();
        let target = syscall::local_endpoint(&listener).unwrap();

        let readable = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&readable);
        let entry = reactor
            .attach_handle(
                listener.as_raw_fd(),
                InterestSet {
                    want_readable: true,
                    ..InterestSet::none()
                },
                Some(Arc::new(move |event: &ReactorEvent| {
                    assert!(event.readable);
                    observed.fetch_add(1, Ordering::SeqCst);
                })),
                None,
                None,
            )
            .unwrap();

        let client = syscall::create(Transport::TcpIpv4Stream).unwrap();
        let _ = syscall::connect(&client, &target);

        drive_until(&reactor, || readable.load(Ordering::SeqCst) > 0);

        reactor.detach(&entry).unwrap();
        assert_eq!(reactor.num_sockets(), 0);
    }

    #[test]
    fn one_shot_reports_once_until_rearmed() {
        let reactor = Reactor::new("test").unwrap();

        let listener = syscall::create(Transport::TcpIpv4Stream).unwrap();
        syscall::bind(&listener, &Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0), true).unwrap();
        syscall::listen(&listener, 8).unwrap();
        let target = syscall::local_endpoint(&listener).unwrap();

        let readable = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&readable);
        let entry = reactor
            .attach_handle(
                listener.as_raw_fd(),
                InterestSet {
                    want_readable: true,
                    one_shot: true,
                    ..InterestSet::none()
                },
                Some(Arc::new(move |_: &ReactorEvent| {
                    observed.fetch_add(1, Ordering::SeqCst);
                })),
                None,
                None,
            )
            .unwrap();

        let client = syscall::create(Transport::TcpIpv4Stream).unwrap();
        let _ = syscall::connect(&client, &target);

        drive_until(&reactor, || readable.load(Ordering::SeqCst) > 0);
        // The connection is still pending accept, but the one-shot interest
        // was hidden before dispatch.
        for _ in 0..5 {
            reactor.drive(Some(Duration::from_millis(5))).unwrap();
        }
        assert_eq!(readable.load(Ordering::SeqCst), 1);

        reactor.show_readable(&entry).unwrap();
        drive_until(&reactor, || readable.load(Ordering::SeqCst) > 1);

        reactor.detach(&entry).unwrap();
    }

    #[test]
    fn detach_callback_runs_on_worker() {
        let reactor = Reactor::new("test").unwrap();

        let listener = syscall::create(Transport::TcpIpv4Stream).unwrap();
        syscall::bind(&listener, &Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0), true).unwrap();
        syscall::listen(&listener, 8).unwrap();

        let entry = reactor
            .attach_handle(
                listener.as_raw_fd(),
                InterestSet {
                    want_readable: true,
                    ..InterestSet::none()
                },
                Some(Arc::new(|_: &ReactorEvent| {})),
                None,
                None,
            )
            .unwrap();

        let detached = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&detached);
        entry.set_detach_callback(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        reactor.detach(&entry).unwrap();
        drive_until(&reactor, || detached.load(Ordering::SeqCst) > 0);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn executor_jobs_run_on_drive() {
        let reactor = Reactor::new("test").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&ran);
        reactor.execute(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        drive_until(&reactor, || ran.load(Ordering::SeqCst) > 0);
    }
}
