//! The asynchronous stream socket.
//!
//! A stream socket owns its handle, open/shutdown/flow-control state, a
//! write queue of outgoing [`Data`] and a read queue fed from the network,
//! pending connect and receive operations with optional deadline timers
//! and cancellation tokens, optional rate limiters, and the zero-copy and
//! timestamp bookkeeping. All terminal callbacks are dispatched through
//! the socket's strand, so their relative order is the order the
//! triggering events were observed by the owning worker.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::buffer::{Blob, Data, GatherList, SliceList};
use crate::chronology::{Job, Timer, TimerEvent, TimerOptions};
use crate::correlate::{TimestampCorrelator, ZeroCopyWaitList};
use crate::encryption::EncryptionSession;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{
    ConnectCallback, ConnectContext, ConnectEvent, EventType, QueueEventType, ReceiveCallback,
    ReceiveContext, ReceiveEvent, SendCallback, SendContext, SendEvent, ShutdownEventType,
    StreamEvent, TimestampHook, TimestampSample, UpgradeCallback, UpgradeContext, UpgradeEvent,
};
use crate::limiter::RateLimiter;
use crate::option::{
    ConnectOptions, OperationToken, ReceiveOptions, SendOptions, SocketOption,
    StreamSocketOptions,
};
use crate::reactor::Reactor;
use crate::registry::{InterestSet, ReactorSocket, RegistryEntry};
use crate::resolver::{IpAddressOptions, Resolver};
use crate::state::{
    FlowControlContext, FlowControlState, FlowControlType, OpenState, ShutdownContext,
    ShutdownOrigin, ShutdownState, ShutdownType,
};
use crate::strand::{Executor, Strand};
use crate::syscall::{self, ErrorQueueNotification, Transport};

/// The target of a connect operation: a concrete endpoint or a name to
/// resolve first.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// Connect to this endpoint.
    Endpoint(Endpoint),
    /// Resolve this `host:port` (or bare host, with a port fallback) first.
    Name(String),
}

impl From<Endpoint> for ConnectTarget {
    fn from(endpoint: Endpoint) -> Self {
        Self::Endpoint(endpoint)
    }
}

impl From<&str> for ConnectTarget {
    fn from(name: &str) -> Self {
        match Endpoint::parse(name) {
            Ok(endpoint) => Self::Endpoint(endpoint),
            Err(_) => Self::Name(name.to_string()),
        }
    }
}

struct WriteEntry {
    id: u64,
    data: Data,
    offset: usize,
    length: usize,
    callback: Option<SendCallback>,
    token: Option<OperationToken>,
    timer: Option<Arc<Timer>>,
    zero_copy: bool,
}

impl WriteEntry {
    fn remaining(&self) -> usize {
        self.length - self.offset
    }
}

#[derive(Default)]
struct WriteQueue {
    entries: VecDeque<WriteEntry>,
    size: usize,
    next_id: u64,
    above_high: bool,
}

struct ReadQueue {
    blob: Blob,
    above_high: bool,
    reached_low: bool,
}

struct ReceiveEntry {
    id: u64,
    options: ReceiveOptions,
    callback: Option<ReceiveCallback>,
    timer: Option<Arc<Timer>>,
}

struct ConnectMachine {
    target: ConnectTarget,
    endpoint: Option<Endpoint>,
    options: ConnectOptions,
    callback: Option<ConnectCallback>,
    attempts_remaining: u32,
    started: Instant,
    retry_timer: Option<Arc<Timer>>,
    deadline_timer: Option<Arc<Timer>>,
}

struct UpgradeMachine {
    callback: Option<UpgradeCallback>,
}

struct StreamState {
    options: StreamSocketOptions,
    transport: Option<Transport>,
    handle: Option<Socket>,
    entry: Option<Arc<RegistryEntry>>,
    open_state: OpenState,
    shutdown_state: ShutdownState,
    flow: FlowControlState,
    write_queue: WriteQueue,
    read_queue: ReadQueue,
    read_scratch: Vec<u8>,
    pending_receives: VecDeque<ReceiveEntry>,
    next_receive_id: u64,
    connect: Option<ConnectMachine>,
    upgrade: Option<UpgradeMachine>,
    encryption: Option<Box<dyn EncryptionSession>>,
    send_limiter: Option<RateLimiter>,
    receive_limiter: Option<RateLimiter>,
    send_rate_timer: Option<Arc<Timer>>,
    receive_rate_timer: Option<Arc<Timer>>,
    zero_copy_list: ZeroCopyWaitList,
    correlator: Option<TimestampCorrelator>,
    bytes_sent_total: u64,
    last_writable: bool,
    shutdown_send_pending: bool,
    detach_started: bool,
    local_endpoint: Option<Endpoint>,
    peer_endpoint: Option<Endpoint>,
}

impl StreamState {
    fn new(options: StreamSocketOptions) -> Self {
        let read_scratch = vec![0u8; options.read_buffer_size.max(1)];
        let blob_segment_size = options.blob_segment_size.max(1);
        Self {
            options,
            transport: None,
            handle: None,
            entry: None,
            open_state: OpenState::Default,
            shutdown_state: ShutdownState::new(),
            flow: FlowControlState::new(),
            write_queue: WriteQueue::default(),
            read_queue: ReadQueue {
                blob: Blob::with_segment_size(blob_segment_size),
                above_high: false,
                reached_low: false,
            },
            read_scratch,
            pending_receives: VecDeque::new(),
            next_receive_id: 0,
            connect: None,
            upgrade: None,
            encryption: None,
            send_limiter: None,
            receive_limiter: None,
            send_rate_timer: None,
            receive_rate_timer: None,
            zero_copy_list: ZeroCopyWaitList::new(),
            correlator: None,
            bytes_sent_total: 0,
            last_writable: false,
            shutdown_send_pending: false,
            detach_started: false,
            local_endpoint: None,
            peer_endpoint: None,
        }
    }
}

pub(crate) struct StreamShared {
    me: Weak<StreamShared>,
    reactor: Mutex<Weak<Reactor>>,
    strand: Arc<Strand>,
    resolver: Arc<Resolver>,
    monitor: Mutex<Option<flume::Sender<StreamEvent>>>,
    timestamp_hook: Mutex<Option<TimestampHook>>,
    on_closed: Mutex<Option<Job>>,
    state: Mutex<StreamState>,
}

/// An asynchronous, callback-driven stream socket bound to one worker.
#[derive(Clone)]
pub struct StreamSocket {
    shared: Arc<StreamShared>,
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket").finish()
    }
}

impl StreamSocket {
    /// Create a socket bound to `reactor`.
    pub fn new(
        reactor: &Arc<Reactor>,
        resolver: Arc<Resolver>,
        options: StreamSocketOptions,
    ) -> Self {
        let executor: Arc<dyn Executor> = reactor.clone();
        let strand = Strand::new(executor);
        let shared = Arc::new_cyclic(|me| StreamShared {
            me: me.clone(),
            reactor: Mutex::new(Arc::downgrade(reactor)),
            strand,
            resolver,
            monitor: Mutex::new(None),
            timestamp_hook: Mutex::new(None),
            on_closed: Mutex::new(None),
            state: Mutex::new(StreamState::new(options)),
        });
        Self { shared }
    }

    /// Wrap an already-connected handle, as produced by a listener accept.
    pub(crate) fn from_accepted(
        reactor: &Arc<Reactor>,
        resolver: Arc<Resolver>,
        options: StreamSocketOptions,
        handle: Socket,
        peer: Option<Endpoint>,
    ) -> Result<Self> {
        let socket = Self::new(reactor, resolver, options);
        socket.shared.adopt_connected(handle, peer)?;
        Ok(socket)
    }

    /// Install a hook invoked once when the socket's handle is released.
    pub(crate) fn set_on_closed(&self, hook: Job) {
        *self.shared.on_closed.lock() = Some(hook);
    }

    /// A channel of this socket's advisory events.
    pub fn monitor(&self) -> flume::Receiver<StreamEvent> {
        let (sender, receiver) = flume::unbounded();
        *self.shared.monitor.lock() = Some(sender);
        receiver
    }

    /// Install the hook receiving correlated transmit-timestamp samples.
    pub fn set_timestamp_hook(&self, hook: TimestampHook) {
        *self.shared.timestamp_hook.lock() = Some(hook);
    }

    /// Allocate the handle for `transport`.
    pub fn open(&self, transport: Transport) -> Result<()> {
        self.shared.open(transport)
    }

    /// Bind the handle to `endpoint`.
    pub fn bind(&self, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.open_state.can_bind() {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let handle = state.handle.as_ref().ok_or(Error::new(ErrorKind::Invalid))?;
        syscall::bind(handle, endpoint, reuse_address)?;
        state.local_endpoint = syscall::local_endpoint(handle).ok();
        Ok(())
    }

    /// Connect to `target`, retrying and resolving names per `options`.
    /// The callback fires exactly once.
    pub fn connect(
        &self,
        target: impl Into<ConnectTarget>,
        options: ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        self.shared.connect(target.into(), options, callback)
    }

    /// Submit `data` for transmission. The callback, if any, fires exactly
    /// once when the data has been handed to the transport (or, for
    /// zero-copy sends, acknowledged by the kernel).
    pub fn send(
        &self,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        self.shared.send(data, options, callback)
    }

    /// Submit a receive. Completes as soon as at least `min_size` bytes are
    /// available, delivering at most `max_size`.
    pub fn receive(&self, options: ReceiveOptions, callback: ReceiveCallback) -> Result<()> {
        self.shared.receive(options, callback)
    }

    /// Complete all pending operations carrying `token` with `Cancelled`.
    pub fn cancel(&self, token: OperationToken) {
        self.shared.cancel(token);
    }

    /// Shut down one or both directions, sequencing announcements and, once
    /// both directions are down, detaching and closing the handle.
    pub fn shutdown(&self, direction: ShutdownType) -> Result<()> {
        self.shared.shutdown(direction)
    }

    /// Shut down both directions and release the handle.
    pub fn close(&self) -> Result<()> {
        self.shutdown(ShutdownType::Both)
    }

    /// Interpose `session` between the socket's queues and the transport,
    /// then run its handshake. The callback fires once with the outcome.
    pub fn upgrade(
        &self,
        session: Box<dyn EncryptionSession>,
        callback: UpgradeCallback,
    ) -> Result<()> {
        self.shared.upgrade(session, callback)
    }

    /// The endpoint the handle is bound to.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.shared
            .state
            .lock()
            .local_endpoint
            .clone()
            .ok_or(Error::new(ErrorKind::Invalid))
    }

    /// The endpoint of the connected peer.
    pub fn peer_endpoint(&self) -> Result<Endpoint> {
        self.shared
            .state
            .lock()
            .peer_endpoint
            .clone()
            .ok_or(Error::new(ErrorKind::Invalid))
    }

    /// The credentials of the peer of a connected local socket.
    pub fn peer_credentials(&self) -> Result<syscall::PeerCredentials> {
        let guard = self.shared.state.lock();
        match (guard.transport, guard.handle.as_ref()) {
            (Some(transport), Some(handle)) if transport.is_local() => {
                syscall::peer_credentials(handle)
            }
            _ => Err(Error::new(ErrorKind::Invalid)),
        }
    }

    /// The number of bytes queued for transmission.
    pub fn write_queue_size(&self) -> usize {
        self.shared.state.lock().write_queue.size
    }

    /// The number of received bytes awaiting a receive operation.
    pub fn read_queue_size(&self) -> usize {
        self.shared.state.lock().read_queue.blob.len()
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// Move this socket to the worker owning `target`: detach from the
    /// source demultiplexer, then attach to the target and retarget the
    /// strand so callbacks follow.
    pub(crate) fn migrate(&self, target: &Arc<Reactor>) -> Result<()> {
        self.shared.migrate(target)
    }
}

impl StreamShared {
    fn reactor(&self) -> Result<Arc<Reactor>> {
        self.reactor
            .lock()
            .upgrade()
            .ok_or(Error::new(ErrorKind::Invalid))
    }

    pub(crate) fn current_reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.lock().upgrade()
    }

    pub(crate) fn migrate_to(self: &Arc<Self>, target: &Arc<Reactor>) -> Result<()> {
        self.migrate(target)
    }

    fn announce(&self, event: StreamEvent) {
        if let Some(monitor) = self.monitor.lock().as_ref() {
            monitor.send(event).ok();
        }
    }

    fn dispatch(&self, jobs: Vec<Job>) {
        for job in jobs {
            self.strand.execute(job);
        }
    }

    fn create_timer(
        self: &Arc<Self>,
        handler: impl Fn(&Arc<StreamShared>) + Send + Sync + 'static,
    ) -> Option<Arc<Timer>> {
        let reactor = self.reactor().ok()?;
        let weak = self.me.clone();
        Some(reactor.chronology().create_timer(
            TimerOptions { one_shot: true },
            Arc::new(move |_, event| {
                if event == TimerEvent::Deadline {
                    if let Some(shared) = weak.upgrade() {
                        handler(&shared);
                    }
                }
            }),
        ))
    }

    fn open(&self, transport: Transport) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.handle.is_some() || state.open_state != OpenState::Default {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let handle = syscall::create(transport)?;
        apply_open_options(state, &handle, transport);
        state.transport = Some(transport);
        state.handle = Some(handle);
        Ok(())
    }

    fn adopt_connected(self: &Arc<Self>, handle: Socket, peer: Option<Endpoint>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let endpoint = peer
            .clone()
            .or_else(|| syscall::peer_endpoint(&handle).ok())
            .ok_or(Error::new(ErrorKind::Invalid))?;
        let transport = Transport::for_endpoint(&endpoint, true);
        apply_open_options(state, &handle, transport);
        state.transport = Some(transport);
        state.local_endpoint = syscall::local_endpoint(&handle).ok();
        state.peer_endpoint = Some(endpoint);
        state.handle = Some(handle);
        state.open_state = OpenState::Connected;
        self.attach_established(state)
    }

    /// Attach the connected handle to the reactor with both flow directions
    /// enabled.
    fn attach_established(self: &Arc<Self>, state: &mut StreamState) -> Result<()> {
        let mut context = FlowControlContext::default();
        state.flow.relax(&mut context, FlowControlType::Both, false);

        let interest = InterestSet {
            want_readable: true,
            want_writable: false,
            want_error: true,
            want_notifications: state.options.zero_copy_threshold.is_some()
                || state.options.timestamp_outgoing_data,
            ..InterestSet::default()
        };
        self.attach_interest(state, interest)
    }

    /// Register the in-flight connect for writability; establishment or
    /// failure is reported by the demultiplexer.
    fn attach_connecting(self: &Arc<Self>, state: &mut StreamState) -> Result<()> {
        let interest = InterestSet {
            want_writable: true,
            want_error: true,
            ..InterestSet::default()
        };
        self.attach_interest(state, interest)
    }

    fn attach_interest(
        self: &Arc<Self>,
        state: &mut StreamState,
        interest: InterestSet,
    ) -> Result<()> {
        let reactor = self.reactor()?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let handle = state.handle.as_ref().ok_or(Error::new(ErrorKind::Invalid))?;
            let session: Arc<dyn ReactorSocket> =
                self.me.upgrade().ok_or(Error::new(ErrorKind::Invalid))?;
            let entry = reactor.attach_socket(handle.as_raw_fd(), interest, session)?;
            state.entry = Some(entry);
        }
        #[cfg(not(unix))]
        {
            let _ = (reactor, state, interest);
            return Err(Error::new(ErrorKind::NotImplemented));
        }
        Ok(())
    }

    // ----- connect pipeline -----

    fn connect(
        self: &Arc<Self>,
        target: ConnectTarget,
        options: ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.open_state.can_connect() || state.connect.is_some() {
                return Err(Error::new(ErrorKind::Invalid));
            }

            let deadline_timer = options.deadline.and_then(|deadline| {
                let timer = self.create_timer(|shared| shared.handle_connect_deadline())?;
                timer.schedule(deadline, None);
                Some(timer)
            });

            state.connect = Some(ConnectMachine {
                target: target.clone(),
                endpoint: None,
                options: options.clone(),
                callback: Some(callback),
                attempts_remaining: options.retry_count + 1,
                started: Instant::now(),
                retry_timer: None,
                deadline_timer,
            });
        }

        match target {
            ConnectTarget::Endpoint(endpoint) => {
                let shared = Arc::clone(self);
                self.strand.execute(Box::new(move || {
                    shared.begin_attempt(Some(endpoint));
                }));
            }
            ConnectTarget::Name(name) => {
                let shared = Arc::clone(self);
                let ip_options = IpAddressOptions {
                    ip_address_type: options.ip_address_type,
                    ip_address_fallback: options.ip_address_fallback,
                    port_fallback: options.port_fallback,
                    ..IpAddressOptions::default()
                };
                self.resolver.get_endpoint_async(
                    name,
                    ip_options,
                    Arc::clone(&self.strand),
                    Box::new(move |resolved| match resolved {
                        Ok(endpoint) => shared.begin_attempt(Some(endpoint)),
                        Err(error) => shared.fail_connect(error),
                    }),
                );
            }
        }
        Ok(())
    }

    fn begin_attempt(self: &Arc<Self>, endpoint: Option<Endpoint>) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(machine) = state.connect.as_mut() else {
                return;
            };
            if let Some(endpoint) = endpoint {
                machine.endpoint = Some(endpoint);
            }
            let Some(endpoint) = machine.endpoint.clone() else {
                drop(guard);
                self.fail_connect(Error::new(ErrorKind::Unreachable));
                return;
            };
            let attempts_remaining = machine.attempts_remaining;
            trace!(%endpoint, attempts_remaining, "connect attempt");

            let transport = Transport::for_endpoint(&endpoint, true);
            if state.handle.is_none() {
                match syscall::create(transport) {
                    Ok(handle) => {
                        apply_open_options(state, &handle, transport);
                        state.transport = Some(transport);
                        state.handle = Some(handle);
                    }
                    Err(error) => {
                        self.attempt_failed(state, error, &mut jobs);
                        drop(guard);
                        self.dispatch(jobs);
                        return;
                    }
                }
            }

            let outcome = {
                let handle = state.handle.as_ref().unwrap();
                syscall::connect(handle, &endpoint)
            };
            match outcome {
                Ok(()) => {
                    // Even an immediately-established connect is resolved
                    // through the writability report.
                    state.open_state = OpenState::Connecting;
                    if let Err(error) = self.attach_connecting(state) {
                        self.attempt_failed(state, error, &mut jobs);
                    }
                }
                Err(error) if error.kind() == ErrorKind::Pending => {
                    state.open_state = OpenState::Connecting;
                    if let Err(error) = self.attach_connecting(state) {
                        self.attempt_failed(state, error, &mut jobs);
                    }
                }
                Err(error) => {
                    self.attempt_failed(state, error, &mut jobs);
                }
            }
        }
        self.dispatch(jobs);
    }

    /// One connect attempt failed: tear the attempt's handle down and either
    /// schedule a retry or complete the operation with the error.
    fn attempt_failed(self: &Arc<Self>, state: &mut StreamState, error: Error, jobs: &mut Vec<Job>) {
        let Some(machine) = state.connect.as_mut() else {
            return;
        };
        machine.attempts_remaining = machine.attempts_remaining.saturating_sub(1);
        let attempts_remaining = machine.attempts_remaining;
        debug!(attempts_remaining, %error, "connect attempt failed");

        let handle = state.handle.take();
        let entry = state.entry.take();
        state.open_state = OpenState::Default;

        let weak = self.me.clone();
        let retry_eligible = attempts_remaining > 0;
        let finish: Job = Box::new(move || {
            drop(handle);
            if let Some(shared) = weak.upgrade() {
                if retry_eligible {
                    shared.schedule_retry();
                } else {
                    shared.fail_connect(error);
                }
            }
        });

        match (entry, self.reactor()) {
            (Some(entry), Ok(reactor)) => {
                // The handle closes only after the demultiplexer has
                // forgotten it.
                entry.set_detach_callback(finish);
                if let Err(detach_error) = reactor.detach(&entry) {
                    debug!(%detach_error, "detach of failed attempt");
                    if let Some(finish) = entry.take_detach_callback() {
                        jobs.push(finish);
                    }
                }
            }
            _ => jobs.push(finish),
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let timer = self.create_timer(|shared| shared.retry_now());
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.connect.is_none() {
            return;
        }
        state.open_state = OpenState::Waiting;
        let interval = state.connect.as_ref().unwrap().options.retry_interval;
        if let Some(timer) = timer {
            timer.schedule(Instant::now() + interval, None);
            state.connect.as_mut().unwrap().retry_timer = Some(timer);
        }
    }

    fn retry_now(self: &Arc<Self>) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(machine) = state.connect.as_mut() else {
                return;
            };
            machine.retry_timer = None;
            if state.open_state != OpenState::Waiting {
                return;
            }
            state.open_state = OpenState::Default;
        }
        self.begin_attempt(None);
    }

    fn handle_connect_deadline(self: &Arc<Self>) {
        self.fail_connect(Error::new(ErrorKind::Cancelled));
    }

    /// Complete the connect operation with `error`, exactly once.
    fn fail_connect(self: &Arc<Self>, error: Error) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(mut machine) = state.connect.take() else {
                return;
            };
            cancel_timer(&mut machine.retry_timer);
            cancel_timer(&mut machine.deadline_timer);

            let handle = state.handle.take();
            let entry = state.entry.take();
            state.open_state = OpenState::Default;

            let endpoint = machine.endpoint.clone();
            let name = match &machine.target {
                ConnectTarget::Name(name) => Some(name.clone()),
                ConnectTarget::Endpoint(_) => None,
            };
            let attempts_remaining = machine.attempts_remaining;
            if let Some(callback) = machine.callback.take() {
                jobs.push(Box::new(move || {
                    callback(ConnectEvent {
                        event_type: EventType::Error,
                        context: ConnectContext {
                            endpoint,
                            name,
                            attempts_remaining,
                            latency: None,
                            error: Some(error),
                        },
                    });
                }));
            }

            if let (Some(entry), Ok(reactor)) = (entry, self.reactor()) {
                entry.set_detach_callback(Box::new(move || drop(handle)));
                reactor.detach(&entry).ok();
            }
        }
        self.dispatch(jobs);
    }

    /// The in-flight connect became writable: resolve it to success or a
    /// failed attempt.
    fn complete_connect_attempt(self: &Arc<Self>) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.open_state != OpenState::Connecting || state.connect.is_none() {
                return;
            }
            let outcome = {
                let handle = state.handle.as_ref().unwrap();
                match syscall::take_error(handle) {
                    Ok(None) => Ok(()),
                    Ok(Some(error)) => Err(error),
                    Err(error) => Err(error),
                }
            };

            match outcome {
                Ok(()) => {
                    let mut machine = state.connect.take().unwrap();
                    cancel_timer(&mut machine.retry_timer);
                    cancel_timer(&mut machine.deadline_timer);

                    {
                        let handle = state.handle.as_ref().unwrap();
                        state.local_endpoint = syscall::local_endpoint(handle).ok();
                        state.peer_endpoint = syscall::peer_endpoint(handle)
                            .ok()
                            .or_else(|| machine.endpoint.clone());
                    }
                    state.open_state = OpenState::Connected;

                    let mut context = FlowControlContext::default();
                    state.flow.relax(&mut context, FlowControlType::Both, false);
                    self.sync_read_interest(state);
                    self.enable_notifications(state);

                    let endpoint = state.peer_endpoint.clone().unwrap();
                    let latency = machine.started.elapsed();
                    let attempts_remaining = machine.attempts_remaining;
                    trace!(%endpoint, ?latency, "connected");
                    if let Some(callback) = machine.callback.take() {
                        jobs.push(Box::new(move || {
                            callback(ConnectEvent::complete(
                                endpoint,
                                latency,
                                attempts_remaining,
                            ));
                        }));
                    }

                    self.drain(state, &mut jobs);
                }
                Err(error) => {
                    self.attempt_failed(state, error, &mut jobs);
                }
            }
        }
        self.dispatch(jobs);
    }

    fn enable_notifications(&self, state: &mut StreamState) {
        let wants = state.options.zero_copy_threshold.is_some()
            || state.options.timestamp_outgoing_data;
        if !wants {
            return;
        }
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        reactor
            .modify_interest(entry, |interest| {
                interest.want_notifications = true;
                interest.want_error = true;
            })
            .ok();
    }

    // ----- send pipeline -----

    fn send(
        self: &Arc<Self>,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let result = self.enqueue_send(state, data, options, callback);
            if result.is_ok() && state.last_writable {
                self.drain(state, &mut jobs);
            }
            result
        };
        self.dispatch(jobs);
        result
    }

    fn enqueue_send(
        self: &Arc<Self>,
        state: &mut StreamState,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        if !state.open_state.can_send()
            || !state.shutdown_state.can_send()
            || state.flow.lock_send()
        {
            return Err(Error::new(ErrorKind::Invalid));
        }

        // File regions are staged through memory so the drain path only
        // gathers from memory.
        let mut data = match data {
            Data::File(region) => {
                Data::Blob(region.read_into_blob(state.options.blob_segment_size)?)
            }
            other => other,
        };
        let mut length = data.len();

        // An active encryption session transforms plaintext to ciphertext
        // at enqueue time; the entry then carries ciphertext.
        if let Some(session) = state.encryption.as_mut() {
            if !session.is_handshake_complete() {
                return Err(Error::new(ErrorKind::Pending));
            }
            let mut ciphertext = Blob::with_segment_size(state.options.blob_segment_size);
            let mut slices = SliceList::new();
            data.gather(0, &mut slices);
            for slice in &slices {
                session.push_outgoing_plain_text(slice)?;
            }
            drop(slices);
            while let Some(chunk) = session.pop_outgoing_cipher_text() {
                ciphertext.write(&chunk);
            }
            length = ciphertext.len();
            data = Data::Blob(ciphertext);
        }

        // An empty submission completes without touching the queue.
        if length == 0 {
            if let Some(callback) = callback {
                let event = SendEvent::complete(0, false);
                self.strand.execute(Box::new(move || callback(event)));
            }
            return Ok(());
        }

        let enqueued = state.write_queue.size + length;
        let high = state.options.write_queue_high_watermark;
        if enqueued >= high && !state.write_queue.above_high {
            state.write_queue.above_high = true;
            self.announce(StreamEvent::WriteQueue(QueueEventType::HighWatermark));
        }
        if enqueued > high && !options.suppress_high_watermark {
            return Err(Error::new(ErrorKind::WouldFlowControl));
        }

        let id = state.write_queue.next_id;
        state.write_queue.next_id += 1;

        let timer = options.deadline.and_then(|deadline| {
            let timer = self.create_timer(move |shared| shared.handle_send_deadline(id))?;
            timer.schedule(deadline, None);
            Some(timer)
        });

        let zero_copy = state.options.zero_copy_threshold.is_some()
            && (options.zero_copy
                || length >= state.options.zero_copy_threshold.unwrap_or(usize::MAX));

        state.write_queue.entries.push_back(WriteEntry {
            id,
            data,
            offset: 0,
            length,
            callback,
            token: options.token,
            timer,
            zero_copy,
        });
        state.write_queue.size += length;

        if state.open_state == OpenState::Connected && !state.last_writable {
            self.show_writable(state);
        }
        Ok(())
    }

    /// Drain the head of the write queue into the transport until the
    /// kernel pushes back, the rate limiter intervenes, or the queue
    /// empties.
    fn drain(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        loop {
            if !state.flow.want_send() || state.open_state != OpenState::Connected {
                return;
            }
            if state.write_queue.entries.is_empty() {
                break;
            }

            let now = Instant::now();
            let mut allowance = usize::MAX;
            if let Some(limiter) = state.send_limiter.as_mut() {
                let allowed = limiter.current_allowance(now);
                if allowed == 0 {
                    self.apply_send_rate_limit(state, now);
                    return;
                }
                allowance = usize::try_from(allowed).unwrap_or(usize::MAX);
            }

            let head_zero_copy = state.write_queue.entries[0].zero_copy;
            let outcome = {
                let mut slices = SliceList::new();
                for entry in &state.write_queue.entries {
                    if entry.zero_copy != head_zero_copy {
                        break;
                    }
                    entry.data.gather(entry.offset, &mut slices);
                    let gathered: usize = slices.iter().map(|slice| slice.len()).sum();
                    if gathered >= allowance || head_zero_copy {
                        break;
                    }
                }
                let mut gather = GatherList::new();
                Data::gather_capped(&slices, allowance, &mut gather);
                if gather.is_empty() {
                    Ok(0)
                } else {
                    let handle = state.handle.as_ref().unwrap();
                    syscall::send_vectored(handle, &gather, head_zero_copy)
                }
            };

            let sent = match outcome {
                Ok(sent) => sent,
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    self.show_writable(state);
                    return;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.fatal_error(state, error, jobs);
                    return;
                }
            };
            if sent == 0 {
                break;
            }

            if let Some(limiter) = state.send_limiter.as_mut() {
                limiter.submit(sent as u64, now);
            }
            if state.options.timestamp_outgoing_data {
                let id = (state.bytes_sent_total + sent as u64 - 1) as u32;
                if let Some(correlator) = state.correlator.as_mut() {
                    correlator.save_timestamp_before_send(id, SystemTime::now());
                }
            }
            state.bytes_sent_total += sent as u64;

            self.advance_write_queue(state, sent, head_zero_copy, jobs);

            if state.write_queue.size <= state.options.write_queue_low_watermark
                && state.write_queue.above_high
            {
                state.write_queue.above_high = false;
                self.announce(StreamEvent::WriteQueue(QueueEventType::LowWatermark));
            }
        }

        if state.write_queue.entries.is_empty() {
            self.hide_writable(state);
            if state.shutdown_send_pending {
                state.shutdown_send_pending = false;
                self.finish_send_shutdown(state, jobs);
                if state.shutdown_state.completed() {
                    self.begin_detach(state, jobs);
                }
            }
        }
    }

    /// Consume `sent` bytes from the head of the write queue, completing
    /// entries that finished.
    fn advance_write_queue(
        self: &Arc<Self>,
        state: &mut StreamState,
        mut sent: usize,
        zero_copy: bool,
        jobs: &mut Vec<Job>,
    ) {
        state.write_queue.size -= sent.min(state.write_queue.size);
        let mut completed_any = false;
        while sent > 0 {
            let Some(entry) = state.write_queue.entries.front_mut() else {
                break;
            };
            let take = entry.remaining().min(sent);
            entry.offset += take;
            sent -= take;

            if entry.remaining() == 0 {
                let mut entry = state.write_queue.entries.pop_front().unwrap();
                cancel_timer(&mut entry.timer);
                if zero_copy {
                    // Completion waits for the kernel's acknowledgement of
                    // the borrowed pages.
                    completed_any = true;
                    let context = SendContext {
                        bytes_sent: entry.length,
                        zero_copy: true,
                        error: None,
                    };
                    let id = state.zero_copy_list.add(context, entry.callback.take());
                    trace!(id, bytes = entry.length, "zero-copy send pending");
                } else if let Some(callback) = entry.callback.take() {
                    let event = SendEvent::complete(entry.length, false);
                    jobs.push(Box::new(move || callback(event)));
                }
            }
        }

        // The kernel assigns one acknowledgement id per zero-copy send
        // call; a partial send consumes an id with no completion to match.
        if zero_copy && !completed_any {
            state.zero_copy_list.add(SendContext::default(), None);
        }
    }

    fn apply_send_rate_limit(self: &Arc<Self>, state: &mut StreamState, now: Instant) {
        let Some(limiter) = state.send_limiter.as_mut() else {
            return;
        };
        // Wake once the queued backlog (up to a full bucket) fits, not per
        // dripped unit.
        let backlog = (state.write_queue.size as u64).max(1);
        let wait = limiter.calculate_time_to_submit_amount(backlog, now);
        let mut context = FlowControlContext::default();
        if state.flow.apply(&mut context, FlowControlType::Send, false) {
            self.announce(StreamEvent::WriteQueue(QueueEventType::RateLimitApplied));
        }
        self.hide_writable(state);

        if state.send_rate_timer.is_none() {
            if let Some(timer) = self.create_timer(|shared| shared.relax_send_rate_limit()) {
                timer.schedule(now + wait, None);
                state.send_rate_timer = Some(timer);
            }
        }
    }

    fn relax_send_rate_limit(self: &Arc<Self>) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.send_rate_timer = None;
            let mut context = FlowControlContext::default();
            if state.flow.relax(&mut context, FlowControlType::Send, false) {
                self.announce(StreamEvent::WriteQueue(QueueEventType::RateLimitRelaxed));
            }
            if !state.write_queue.entries.is_empty() {
                self.drain(state, &mut jobs);
            }
        }
        self.dispatch(jobs);
    }

    fn handle_send_deadline(self: &Arc<Self>, id: u64) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let position = state
                .write_queue
                .entries
                .iter()
                .position(|entry| entry.id == id);
            if let Some(index) = position {
                // A partially transmitted head entry can no longer be
                // withdrawn without corrupting the stream.
                if state.write_queue.entries[index].offset > 0 {
                    return;
                }
                let mut entry = state.write_queue.entries.remove(index).unwrap();
                state.write_queue.size -= entry.remaining();
                cancel_timer(&mut entry.timer);
                if let Some(callback) = entry.callback.take() {
                    let event = SendEvent::error(Error::new(ErrorKind::Cancelled));
                    jobs.push(Box::new(move || callback(event)));
                }
            }
        }
        self.dispatch(jobs);
    }

    // ----- receive pipeline -----

    fn receive(self: &Arc<Self>, options: ReceiveOptions, callback: ReceiveCallback) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.open_state.can_receive() || !state.shutdown_state.can_receive() {
                return Err(Error::new(ErrorKind::Invalid));
            }

            let min_size = options.min_size.max(1);
            if state.read_queue.blob.len() >= min_size {
                let data = state.read_queue.blob.extract(options.max_size);
                let context = ReceiveContext {
                    endpoint: state.local_endpoint.clone(),
                    foreign_endpoint: state.peer_endpoint.clone(),
                    ..ReceiveContext::default()
                };
                let event = ReceiveEvent::complete(data, context);
                jobs.push(Box::new(move || callback(event)));
                self.after_read_queue_drained(state);
            } else {
                let id = state.next_receive_id;
                state.next_receive_id += 1;

                let timer = options.deadline.and_then(|deadline| {
                    let timer =
                        self.create_timer(move |shared| shared.handle_receive_deadline(id))?;
                    timer.schedule(deadline, None);
                    Some(timer)
                });

                state.pending_receives.push_back(ReceiveEntry {
                    id,
                    options,
                    callback: Some(callback),
                    timer,
                });
                self.sync_read_interest(state);
            }
        }
        self.dispatch(jobs);
        Ok(())
    }

    /// Pull bytes from the transport into the read queue and satisfy
    /// pending receives, until the kernel runs dry or flow control stops
    /// the direction.
    fn fill(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        loop {
            if !state.flow.want_receive() || !state.shutdown_state.can_receive() {
                return;
            }

            let now = Instant::now();
            let mut cap = state.read_scratch.len();
            if let Some(limiter) = state.receive_limiter.as_mut() {
                let allowed = limiter.current_allowance(now);
                if allowed == 0 {
                    self.apply_receive_rate_limit(state, now);
                    return;
                }
                cap = cap.min(usize::try_from(allowed).unwrap_or(usize::MAX));
            }

            let mut scratch = std::mem::take(&mut state.read_scratch);
            let outcome = {
                let handle = state.handle.as_ref().unwrap();
                syscall::receive(handle, &mut scratch[..cap])
            };
            state.read_scratch = scratch;

            match outcome {
                Ok(0) => {
                    self.handle_remote_shutdown(state, jobs);
                    return;
                }
                Ok(received) => {
                    if let Some(limiter) = state.receive_limiter.as_mut() {
                        limiter.submit(received as u64, now);
                    }
                    self.ingest(state, received, jobs);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.fatal_error(state, error, jobs);
                    return;
                }
            }
        }
    }

    /// Move `received` scratch bytes into the read queue (through the
    /// encryption session when one is active) and run the queue's
    /// announcements and completions.
    fn ingest(self: &Arc<Self>, state: &mut StreamState, received: usize, jobs: &mut Vec<Job>) {
        if state.encryption.is_some() {
            self.ingest_cipher_text(state, received, jobs);
        } else {
            let scratch = std::mem::take(&mut state.read_scratch);
            state.read_queue.blob.write(&scratch[..received]);
            state.read_scratch = scratch;
        }

        let len = state.read_queue.blob.len();
        let low = state.options.read_queue_low_watermark;
        let high = state.options.read_queue_high_watermark;

        if len >= low && !state.read_queue.reached_low {
            state.read_queue.reached_low = true;
            self.announce(StreamEvent::ReadQueue(QueueEventType::LowWatermark));
        }
        if len >= high && !state.read_queue.above_high {
            state.read_queue.above_high = true;
            self.announce(StreamEvent::ReadQueue(QueueEventType::HighWatermark));
            let mut context = FlowControlContext::default();
            if state
                .flow
                .apply(&mut context, FlowControlType::Receive, false)
            {
                self.announce(StreamEvent::ReadQueue(QueueEventType::FlowControlApplied));
            }
            self.sync_read_interest(state);
        }

        self.satisfy_pending_receives(state, jobs);
    }

    fn ingest_cipher_text(
        self: &Arc<Self>,
        state: &mut StreamState,
        received: usize,
        jobs: &mut Vec<Job>,
    ) {
        let was_established = state
            .encryption
            .as_ref()
            .is_some_and(|session| session.is_handshake_complete());
        let scratch = std::mem::take(&mut state.read_scratch);
        let push_result = match state.encryption.as_mut() {
            Some(session) => session.push_incoming_cipher_text(&scratch[..received]),
            None => Ok(()),
        };
        state.read_scratch = scratch;
        if let Err(error) = push_result {
            self.fail_upgrade(state, error, jobs);
            return;
        }

        // The handshake may want to answer with more ciphertext.
        let mut outgoing = Vec::new();
        if let Some(session) = state.encryption.as_mut() {
            while let Some(chunk) = session.pop_outgoing_cipher_text() {
                outgoing.push(chunk);
            }
            while let Some(plain) = session.pop_incoming_plain_text() {
                state.read_queue.blob.write(&plain);
            }
        }
        for chunk in outgoing {
            self.enqueue_raw(state, chunk);
        }

        let established_now = state
            .encryption
            .as_ref()
            .is_some_and(|session| session.is_handshake_complete());
        if !was_established && established_now {
            let certificate = state
                .encryption
                .as_ref()
                .and_then(|session| session.peer_certificate());
            if let Some(machine) = state.upgrade.as_mut() {
                if let Some(callback) = machine.callback.take() {
                    jobs.push(Box::new(move || {
                        callback(UpgradeEvent {
                            event_type: EventType::Complete,
                            context: UpgradeContext {
                                peer_certificate: certificate,
                                error: None,
                            },
                        });
                    }));
                }
            }
            state.upgrade = None;
        }
    }

    fn satisfy_pending_receives(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        loop {
            let Some(front) = state.pending_receives.front() else {
                break;
            };
            let min_size = front.options.min_size.max(1);
            if state.read_queue.blob.len() < min_size {
                break;
            }
            let mut entry = state.pending_receives.pop_front().unwrap();
            cancel_timer(&mut entry.timer);
            let data = state.read_queue.blob.extract(entry.options.max_size);
            let context = ReceiveContext {
                endpoint: state.local_endpoint.clone(),
                foreign_endpoint: state.peer_endpoint.clone(),
                ..ReceiveContext::default()
            };
            if let Some(callback) = entry.callback.take() {
                let event = ReceiveEvent::complete(data, context);
                jobs.push(Box::new(move || callback(event)));
            }
        }
        self.after_read_queue_drained(state);
    }

    /// Re-open the receive direction once the read queue falls back under
    /// its watermarks.
    fn after_read_queue_drained(self: &Arc<Self>, state: &mut StreamState) {
        let len = state.read_queue.blob.len();
        if len < state.options.read_queue_low_watermark {
            state.read_queue.reached_low = false;
        }
        if state.read_queue.above_high && len <= state.options.read_queue_low_watermark {
            state.read_queue.above_high = false;
            let mut context = FlowControlContext::default();
            if state
                .flow
                .relax(&mut context, FlowControlType::Receive, false)
            {
                self.announce(StreamEvent::ReadQueue(QueueEventType::FlowControlRelaxed));
            }
            self.sync_read_interest(state);
        }
    }

    fn apply_receive_rate_limit(self: &Arc<Self>, state: &mut StreamState, now: Instant) {
        let Some(limiter) = state.receive_limiter.as_mut() else {
            return;
        };
        let refill = (state.read_scratch.len() as u64).max(1);
        let wait = limiter.calculate_time_to_submit_amount(refill, now);
        let mut context = FlowControlContext::default();
        if state
            .flow
            .apply(&mut context, FlowControlType::Receive, false)
        {
            self.announce(StreamEvent::ReadQueue(QueueEventType::RateLimitApplied));
        }
        self.sync_read_interest(state);

        if state.receive_rate_timer.is_none() {
            if let Some(timer) = self.create_timer(|shared| shared.relax_receive_rate_limit()) {
                timer.schedule(now + wait, None);
                state.receive_rate_timer = Some(timer);
            }
        }
    }

    fn relax_receive_rate_limit(self: &Arc<Self>) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.receive_rate_timer = None;
            let mut context = FlowControlContext::default();
            if state
                .flow
                .relax(&mut context, FlowControlType::Receive, false)
            {
                self.announce(StreamEvent::ReadQueue(QueueEventType::RateLimitRelaxed));
            }
            self.sync_read_interest(state);
            if state.open_state == OpenState::Connected {
                self.fill(state, &mut jobs);
            }
        }
        self.dispatch(jobs);
    }

    fn handle_receive_deadline(self: &Arc<Self>, id: u64) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let position = state
                .pending_receives
                .iter()
                .position(|entry| entry.id == id);
            if let Some(index) = position {
                let mut entry = state.pending_receives.remove(index).unwrap();
                cancel_timer(&mut entry.timer);
                if let Some(callback) = entry.callback.take() {
                    let event = ReceiveEvent::error(Error::new(ErrorKind::Cancelled));
                    jobs.push(Box::new(move || callback(event)));
                }
            }
        }
        self.dispatch(jobs);
    }

    // ----- cancellation -----

    fn cancel(self: &Arc<Self>, token: OperationToken) {
        let mut jobs: Vec<Job> = Vec::new();
        let mut fail_connect = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(machine) = state.connect.as_ref() {
                if machine.options.token == Some(token) {
                    fail_connect = true;
                }
            }

            let mut index = 0;
            while index < state.write_queue.entries.len() {
                let matches = state.write_queue.entries[index].token == Some(token)
                    && state.write_queue.entries[index].offset == 0;
                if matches {
                    let mut entry = state.write_queue.entries.remove(index).unwrap();
                    state.write_queue.size -= entry.remaining();
                    cancel_timer(&mut entry.timer);
                    if let Some(callback) = entry.callback.take() {
                        let event = SendEvent::error(Error::new(ErrorKind::Cancelled));
                        jobs.push(Box::new(move || callback(event)));
                    }
                } else {
                    index += 1;
                }
            }

            let mut index = 0;
            while index < state.pending_receives.len() {
                if state.pending_receives[index].options.token == Some(token) {
                    let mut entry = state.pending_receives.remove(index).unwrap();
                    cancel_timer(&mut entry.timer);
                    if let Some(callback) = entry.callback.take() {
                        let event = ReceiveEvent::error(Error::new(ErrorKind::Cancelled));
                        jobs.push(Box::new(move || callback(event)));
                    }
                } else {
                    index += 1;
                }
            }
        }
        self.dispatch(jobs);
        if fail_connect {
            self.fail_connect(Error::new(ErrorKind::Cancelled));
        }
    }

    // ----- shutdown sequencing -----

    fn shutdown(self: &Arc<Self>, direction: ShutdownType) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.open_state == OpenState::Default && state.connect.is_none() {
                return Err(Error::new(ErrorKind::Invalid));
            }
            let keep_half_open = state.options.keep_half_open;

            match direction {
                ShutdownType::Send => {
                    let mut context = ShutdownContext::default();
                    state
                        .shutdown_state
                        .try_shutdown_send(&mut context, keep_half_open);
                    self.run_shutdown_context(state, context, &mut jobs);
                }
                ShutdownType::Receive => {
                    let mut context = ShutdownContext::default();
                    state.shutdown_state.try_shutdown_receive(
                        &mut context,
                        keep_half_open,
                        ShutdownOrigin::Source,
                    );
                    self.run_shutdown_context(state, context, &mut jobs);
                }
                ShutdownType::Both => {
                    // Send before receive; each direction cascades nothing
                    // since both are shut down explicitly.
                    let mut send_context = ShutdownContext::default();
                    state
                        .shutdown_state
                        .try_shutdown_send(&mut send_context, true);
                    self.run_shutdown_context(state, send_context, &mut jobs);
                    let mut receive_context = ShutdownContext::default();
                    state.shutdown_state.try_shutdown_receive(
                        &mut receive_context,
                        true,
                        ShutdownOrigin::Source,
                    );
                    self.run_shutdown_context(state, receive_context, &mut jobs);
                }
            }
        }
        self.dispatch(jobs);
        Ok(())
    }

    fn run_shutdown_context(
        self: &Arc<Self>,
        state: &mut StreamState,
        context: ShutdownContext,
        jobs: &mut Vec<Job>,
    ) {
        if context.shutdown_initiated() {
            self.announce(StreamEvent::Shutdown(ShutdownEventType::Initiated));
        }
        if context.shutdown_send() {
            if state.write_queue.entries.is_empty() || state.open_state != OpenState::Connected {
                self.finish_send_shutdown(state, jobs);
            } else {
                // Queued data is flushed before the half-side goes down.
                state.shutdown_send_pending = true;
            }
        }
        if context.shutdown_receive() {
            self.finish_receive_shutdown(state, jobs);
        }
        if context.shutdown_completed() && !state.shutdown_send_pending {
            self.begin_detach(state, jobs);
        }
    }

    fn finish_send_shutdown(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        // A graceful close alert precedes the transport-level shutdown.
        let mut alerts = Vec::new();
        if let Some(session) = state.encryption.as_mut() {
            session.shutdown().ok();
            while let Some(chunk) = session.pop_outgoing_cipher_text() {
                alerts.push(chunk);
            }
        }
        if let Some(handle) = state.handle.as_ref() {
            for chunk in alerts {
                let _ = syscall::send_vectored(handle, &[IoSlice::new(&chunk)], false);
            }
        }

        self.discard_write_queue(state, jobs);
        if let Some(handle) = state.handle.as_ref() {
            syscall::shutdown(handle, std::net::Shutdown::Write).ok();
        }
        let mut context = FlowControlContext::default();
        state.flow.apply(&mut context, FlowControlType::Send, true);
        self.announce(StreamEvent::Shutdown(ShutdownEventType::Send));
    }

    fn finish_receive_shutdown(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        // Satisfiable receives still drain the read queue; the rest see EOF.
        self.satisfy_pending_receives(state, jobs);
        while let Some(mut entry) = state.pending_receives.pop_front() {
            cancel_timer(&mut entry.timer);
            if let Some(callback) = entry.callback.take() {
                let event = ReceiveEvent::error(Error::new(ErrorKind::Eof));
                jobs.push(Box::new(move || callback(event)));
            }
        }
        if let Some(handle) = state.handle.as_ref() {
            syscall::shutdown(handle, std::net::Shutdown::Read).ok();
        }
        let mut context = FlowControlContext::default();
        state
            .flow
            .apply(&mut context, FlowControlType::Receive, true);
        self.sync_read_interest(state);
        self.announce(StreamEvent::Shutdown(ShutdownEventType::Receive));
    }

    fn discard_write_queue(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        if state.write_queue.entries.is_empty() {
            return;
        }
        self.announce(StreamEvent::WriteQueue(QueueEventType::Discarded));
        while let Some(mut entry) = state.write_queue.entries.pop_front() {
            cancel_timer(&mut entry.timer);
            if let Some(callback) = entry.callback.take() {
                let event = SendEvent::error(Error::new(ErrorKind::Cancelled));
                jobs.push(Box::new(move || callback(event)));
            }
        }
        state.write_queue.size = 0;
    }

    /// The peer shut down its sending side: end-of-file on read.
    fn handle_remote_shutdown(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        let keep_half_open = state.options.keep_half_open;
        let mut context = ShutdownContext::default();
        if !state.shutdown_state.try_shutdown_receive(
            &mut context,
            keep_half_open,
            ShutdownOrigin::Remote,
        ) {
            return;
        }
        trace!(keep_half_open, "peer shut down its sending side");
        self.run_shutdown_context(state, context, jobs);
    }

    /// A non-retryable transport error: fail everything, shut both
    /// directions down, and announce the error before the completion.
    fn fatal_error(self: &Arc<Self>, state: &mut StreamState, error: Error, jobs: &mut Vec<Job>) {
        warn!(%error, "fatal transport error");
        self.announce(StreamEvent::Error(error));

        while let Some(mut entry) = state.write_queue.entries.pop_front() {
            cancel_timer(&mut entry.timer);
            if let Some(callback) = entry.callback.take() {
                let event = SendEvent::error(error);
                jobs.push(Box::new(move || callback(event)));
            }
        }
        state.write_queue.size = 0;

        while let Some(mut entry) = state.pending_receives.pop_front() {
            cancel_timer(&mut entry.timer);
            if let Some(callback) = entry.callback.take() {
                let event = ReceiveEvent::error(error);
                jobs.push(Box::new(move || callback(event)));
            }
        }

        let mut initiated = ShutdownContext::default();
        state.shutdown_state.try_shutdown_send(&mut initiated, false);
        let mut context = ShutdownContext::default();
        state
            .shutdown_state
            .try_shutdown_receive(&mut context, false, ShutdownOrigin::Remote);
        state.shutdown_send_pending = false;

        if initiated.shutdown_initiated() {
            self.announce(StreamEvent::Shutdown(ShutdownEventType::Initiated));
        }
        state.flow.close();
        self.begin_detach(state, jobs);
    }

    /// Detach from the demultiplexer; when detachment completes, close the
    /// handle and announce `ShutdownComplete`.
    fn begin_detach(self: &Arc<Self>, state: &mut StreamState, jobs: &mut Vec<Job>) {
        if state.detach_started {
            return;
        }
        state.detach_started = true;
        state.flow.close();

        for (callback, event) in state.zero_copy_list.cancel_wait() {
            jobs.push(Box::new(move || callback(event)));
        }
        cancel_timer(&mut state.send_rate_timer);
        cancel_timer(&mut state.receive_rate_timer);

        match (state.entry.take(), self.reactor().ok()) {
            (Some(entry), Some(reactor)) => {
                let weak = self.me.clone();
                entry.set_detach_callback(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.finish_close();
                    }
                }));
                if let Err(error) = reactor.detach(&entry) {
                    debug!(%error, "detach");
                    if let Some(callback) = entry.take_detach_callback() {
                        jobs.push(callback);
                    }
                }
            }
            _ => {
                let weak = self.me.clone();
                jobs.push(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.finish_close();
                    }
                }));
            }
        }
    }

    fn finish_close(self: &Arc<Self>) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.open_state = OpenState::Closed;
            state.handle = None;
            state.entry = None;
        }
        self.announce(StreamEvent::Shutdown(ShutdownEventType::Complete));
        if let Some(hook) = self.on_closed.lock().take() {
            hook();
        }
    }

    // ----- migration -----

    fn migrate(self: &Arc<Self>, target: &Arc<Reactor>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.detach_started {
            return Err(Error::new(ErrorKind::Invalid));
        }

        let source = self.reactor()?;
        if Arc::ptr_eq(&source, target) {
            return Ok(());
        }

        // Future dispatches and timers land on the target worker.
        let executor: Arc<dyn Executor> = target.clone();
        self.strand.retarget(executor);
        *self.reactor.lock() = Arc::downgrade(target);

        let Some(entry) = state.entry.take() else {
            return Ok(());
        };
        trace!(source = source.name(), target = target.name(), "migrating");

        let weak = self.me.clone();
        entry.set_detach_callback(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.finish_migration();
            }
        }));
        source.detach(&entry)
    }

    /// Re-attach on the target worker once the source has forgotten the
    /// handle.
    fn finish_migration(self: &Arc<Self>) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.detach_started || state.handle.is_none() {
                return;
            }

            let want_notifications = state.options.zero_copy_threshold.is_some()
                || state.options.timestamp_outgoing_data;
            let interest = InterestSet {
                want_readable: state.flow.want_receive() && state.shutdown_state.can_receive(),
                want_writable: !state.write_queue.entries.is_empty()
                    || state.open_state == OpenState::Connecting,
                want_error: true,
                want_notifications,
                ..InterestSet::default()
            };
            state.last_writable = false;
            if let Err(error) = self.attach_interest(state, interest) {
                self.fatal_error(state, error, &mut jobs);
            }
        }
        self.dispatch(jobs);
    }

    // ----- encryption upgrade -----

    fn upgrade(
        self: &Arc<Self>,
        mut session: Box<dyn EncryptionSession>,
        callback: UpgradeCallback,
    ) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.open_state != OpenState::Connected || state.encryption.is_some() {
                return Err(Error::new(ErrorKind::Invalid));
            }
            session.initiate_handshake()?;
            let mut outgoing = Vec::new();
            while let Some(chunk) = session.pop_outgoing_cipher_text() {
                outgoing.push(chunk);
            }
            state.encryption = Some(session);
            state.upgrade = Some(UpgradeMachine {
                callback: Some(callback),
            });
            for chunk in outgoing {
                self.enqueue_raw(state, chunk);
            }
            if state.last_writable {
                self.drain(state, &mut jobs);
            }
        }
        self.dispatch(jobs);
        Ok(())
    }

    fn fail_upgrade(self: &Arc<Self>, state: &mut StreamState, error: Error, jobs: &mut Vec<Job>) {
        if let Some(machine) = state.upgrade.as_mut() {
            if let Some(callback) = machine.callback.take() {
                jobs.push(Box::new(move || {
                    callback(UpgradeEvent {
                        event_type: EventType::Error,
                        context: UpgradeContext {
                            peer_certificate: None,
                            error: Some(error),
                        },
                    });
                }));
            }
        }
        state.upgrade = None;
        state.encryption = None;
        self.fatal_error(state, error, jobs);
    }

    /// Enqueue engine-internal bytes (handshake records, alerts) without a
    /// completion callback and outside the high-watermark check.
    fn enqueue_raw(self: &Arc<Self>, state: &mut StreamState, chunk: bytes::Bytes) {
        let length = chunk.len();
        if length == 0 {
            return;
        }
        let id = state.write_queue.next_id;
        state.write_queue.next_id += 1;
        state.write_queue.entries.push_back(WriteEntry {
            id,
            data: Data::Bytes(chunk),
            offset: 0,
            length,
            callback: None,
            token: None,
            timer: None,
            zero_copy: false,
        });
        state.write_queue.size += length;
        if state.open_state == OpenState::Connected && !state.last_writable {
            self.show_writable(state);
        }
    }

    // ----- interest plumbing -----

    /// Keep the readable interest aligned with the receive flow state.
    fn sync_read_interest(&self, state: &mut StreamState) {
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        let want_readable = state.flow.want_receive() && state.shutdown_state.can_receive();
        let result = reactor.modify_interest(entry, |interest| {
            interest.want_readable = want_readable;
        });
        if let Err(error) = result {
            debug!(%error, "interest sync");
        }
    }

    fn show_writable(&self, state: &mut StreamState) {
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        if reactor
            .modify_interest(entry, |interest| interest.want_writable = true)
            .is_ok()
        {
            state.last_writable = false;
        }
    }

    fn hide_writable(&self, state: &mut StreamState) {
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        reactor
            .modify_interest(entry, |interest| interest.want_writable = false)
            .ok();
    }

    // ----- error-queue notifications -----

    /// Drain zero-copy acknowledgements and transmit timestamps off the
    /// error queue. Returns true if any notification was consumed.
    fn process_error_queue(self: &Arc<Self>) -> bool {
        let mut jobs: Vec<Job> = Vec::new();
        let mut handled = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(handle) = state.handle.as_ref() else {
                return true;
            };
            let notifications = syscall::drain_error_queue(handle).unwrap_or_default();
            for notification in notifications {
                handled = true;
                match notification {
                    ErrorQueueNotification::ZeroCopy { from, to, .. } => {
                        trace!(from, to, "zero-copy acknowledged");
                        for (callback, event) in state.zero_copy_list.acknowledge(from, to) {
                            jobs.push(Box::new(move || callback(event)));
                        }
                    }
                    ErrorQueueNotification::Timestamp {
                        id,
                        timestamp_type,
                        time,
                    } => {
                        let latency = state
                            .correlator
                            .as_mut()
                            .and_then(|correlator| {
                                correlator.timestamp_received(id, timestamp_type, time)
                            });
                        if let Some(latency) = latency {
                            let sample = TimestampSample {
                                id,
                                timestamp_type,
                                latency,
                            };
                            if let Some(hook) = self.timestamp_hook.lock().clone() {
                                jobs.push(Box::new(move || hook(sample)));
                            }
                        }
                    }
                }
            }
        }
        self.dispatch(jobs);
        handled
    }
}

impl ReactorSocket for StreamShared {
    fn process_readable(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            if state.open_state == OpenState::Connected {
                this.fill(state, &mut jobs);
            }
        }
        this.dispatch(jobs);
    }

    fn process_writable(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let connecting = {
            let guard = this.state.lock();
            guard.open_state == OpenState::Connecting
        };
        if connecting {
            this.complete_connect_attempt();
            return;
        }
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            state.last_writable = true;
            this.drain(state, &mut jobs);
        }
        this.dispatch(jobs);
    }

    fn process_error(&self, _error: Error) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        if this.process_error_queue() {
            return;
        }

        // An in-flight connect resolves its own SO_ERROR; do not consume
        // it here.
        let connecting = {
            let guard = this.state.lock();
            guard.open_state == OpenState::Connecting
        };
        if connecting {
            this.complete_connect_attempt();
            return;
        }

        // No queued notifications: a real socket error.
        let latched = {
            let guard = this.state.lock();
            match guard.handle.as_ref() {
                Some(handle) => syscall::take_error(handle).ok().flatten(),
                None => None,
            }
        };
        let Some(error) = latched else {
            return;
        };
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            this.fatal_error(state, error, &mut jobs);
        }
        this.dispatch(jobs);
    }

    fn process_notifications(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        if !this.process_error_queue() {
            // Nothing queued: fold into the plain error path.
            this.process_error(Error::new(ErrorKind::Other));
        }
    }
}

fn apply_open_options(state: &mut StreamState, handle: &Socket, transport: Transport) {
    if state.options.no_delay && !transport.is_local() {
        syscall::set_option(handle, &SocketOption::DelayTransmission(false)).ok();
    }
    if state.options.zero_copy_threshold.is_some() {
        if let Err(error) = syscall::set_zero_copy(handle, true) {
            debug!(%error, "zero-copy unavailable");
            state.options.zero_copy_threshold = None;
        }
    }
    if state.options.timestamp_outgoing_data {
        match syscall::set_tx_timestamping(handle, true) {
            Ok(()) => {
                state.correlator = Some(TimestampCorrelator::new(transport.is_stream()));
            }
            Err(error) => {
                debug!(%error, "transmit timestamping unavailable");
                state.options.timestamp_outgoing_data = false;
            }
        }
    }
    for option in state.options.socket_options.clone() {
        if let Err(error) = syscall::set_option(handle, &option) {
            debug!(%error, ?option, "socket option rejected");
        }
    }
    let now = Instant::now();
    if state.send_limiter.is_none() {
        if let Some(config) = state.options.send_rate_limiter {
            state.send_limiter = Some(RateLimiter::new(&config, now));
        }
    }
    if state.receive_limiter.is_none() {
        if let Some(config) = state.options.receive_rate_limiter {
            state.receive_limiter = Some(RateLimiter::new(&config, now));
        }
    }
}

fn cancel_timer(slot: &mut Option<Arc<Timer>>) {
    if let Some(timer) = slot.take() {
        timer.cancel();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn drive_until(reactors: &[&Arc<Reactor>], mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "reactors did not converge");
            for reactor in reactors {
                reactor.drive(Some(Duration::from_millis(5))).unwrap();
            }
        }
    }

    #[test]
    fn migration_keeps_socket_functional() {
        let source = Reactor::new("source").unwrap();
        let target = Reactor::new("target").unwrap();
        let resolver = Resolver::new();
        let socket = StreamSocket::new(&source, resolver, StreamSocketOptions::new());

        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let endpoint = Endpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();

        let (connect_tx, connect_rx) = flume::unbounded();
        socket
            .connect(
                endpoint,
                ConnectOptions::new(),
                Box::new(move |event| {
                    connect_tx.send(event).ok();
                }),
            )
            .unwrap();
        drive_until(&[&source, &target], || !connect_rx.is_empty());
        assert_eq!(connect_rx.recv().unwrap().event_type, EventType::Complete);
        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(source.num_sockets(), 1);

        socket.migrate(&target).unwrap();
        drive_until(&[&source, &target], || target.num_sockets() == 1);
        assert_eq!(source.num_sockets(), 0);

        peer.write_all(b"MIGRATED").unwrap();

        let (receive_tx, receive_rx) = flume::unbounded();
        socket
            .receive(
                ReceiveOptions::new().with_min_size(8),
                Box::new(move |event| {
                    receive_tx.send(event).ok();
                }),
            )
            .unwrap();
        drive_until(&[&source, &target], || !receive_rx.is_empty());
        let event = receive_rx.recv().unwrap();
        assert_eq!(event.event_type, EventType::Complete);
        assert_eq!(event.data.unwrap().to_bytes().as_ref(), b"MIGRATED");
    }

    #[test]
    fn connect_target_parses_literals() {
        match ConnectTarget::from("127.0.0.1:80") {
            ConnectTarget::Endpoint(endpoint) => {
                assert_eq!(endpoint.port(), Some(80));
            }
            other => panic!("expected endpoint target, got {other:?}"),
        }
        assert!(matches!(
            ConnectTarget::from("db.internal:80"),
            ConnectTarget::Name(_)
        ));
    }
}
