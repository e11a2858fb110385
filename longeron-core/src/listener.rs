//! The asynchronous listener socket.
//!
//! Mirrors the stream socket's discipline with an accept queue of
//! already-accepted child handles in place of a read queue: watermarks
//! apply accept flow control, an optional rate limiter paces the accept
//! pump, a connection limit closes overflow connections outright, and
//! pending accepts complete in FIFO order as children arrive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::chronology::{Job, Timer, TimerEvent, TimerOptions};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{AcceptContext, AcceptEvent, EventType, ListenerEvent, QueueEventType,
    ShutdownEventType};
use crate::limiter::RateLimiter;
use crate::option::{AcceptOptions, ListenerSocketOptions, OperationToken};
use crate::reactor::Reactor;
use crate::registry::{InterestSet, ReactorSocket, RegistryEntry};
use crate::resolver::Resolver;
use crate::state::{FlowControlContext, FlowControlState, FlowControlType};
use crate::strand::{Executor, Strand};
use crate::stream::StreamSocket;
use crate::syscall::{self, Transport};

/// The terminal callback of an accept operation; on completion the second
/// argument carries the accepted child socket.
pub type AcceptCallback = Box<dyn FnOnce(AcceptEvent, Option<StreamSocket>) + Send>;

/// Chooses the worker that will drive an accepted child socket; `None`
/// falls back to the listener's own worker.
pub type ChildPlacement = Arc<dyn Fn() -> Option<Arc<Reactor>> + Send + Sync>;

struct AcceptEntry {
    id: u64,
    options: AcceptOptions,
    callback: Option<AcceptCallback>,
    timer: Option<Arc<Timer>>,
}

struct ListenerState {
    options: ListenerSocketOptions,
    handle: Option<Socket>,
    entry: Option<Arc<RegistryEntry>>,
    listening: bool,
    flow: FlowControlState,
    accept_queue: VecDeque<(Socket, Option<Endpoint>)>,
    pending_accepts: VecDeque<AcceptEntry>,
    next_accept_id: u64,
    accept_limiter: Option<RateLimiter>,
    accept_rate_timer: Option<Arc<Timer>>,
    above_high: bool,
    detach_started: bool,
    closed: bool,
    local_endpoint: Option<Endpoint>,
}

pub(crate) struct ListenerShared {
    me: Weak<ListenerShared>,
    reactor: Weak<Reactor>,
    strand: Arc<Strand>,
    resolver: Arc<Resolver>,
    monitor: Mutex<Option<flume::Sender<ListenerEvent>>>,
    placement: Mutex<Option<ChildPlacement>>,
    active_children: Arc<AtomicUsize>,
    state: Mutex<ListenerState>,
}

/// An asynchronous, callback-driven listener socket bound to one worker.
#[derive(Clone)]
pub struct ListenerSocket {
    shared: Arc<ListenerShared>,
}

impl ListenerSocket {
    /// Create a listener bound to `reactor`.
    pub fn new(
        reactor: &Arc<Reactor>,
        resolver: Arc<Resolver>,
        options: ListenerSocketOptions,
    ) -> Self {
        let executor: Arc<dyn Executor> = reactor.clone();
        let strand = Strand::new(executor);
        let accept_limiter = options
            .accept_rate_limiter
            .as_ref()
            .map(|config| RateLimiter::new(config, Instant::now()));
        let shared = Arc::new_cyclic(|me| ListenerShared {
            me: me.clone(),
            reactor: Arc::downgrade(reactor),
            strand,
            resolver,
            monitor: Mutex::new(None),
            placement: Mutex::new(None),
            active_children: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(ListenerState {
                options,
                handle: None,
                entry: None,
                listening: false,
                flow: FlowControlState::new(),
                accept_queue: VecDeque::new(),
                pending_accepts: VecDeque::new(),
                next_accept_id: 0,
                accept_limiter,
                accept_rate_timer: None,
                above_high: false,
                detach_started: false,
                closed: false,
                local_endpoint: None,
            }),
        });
        Self { shared }
    }

    /// A channel of this listener's advisory events.
    pub fn monitor(&self) -> flume::Receiver<ListenerEvent> {
        let (sender, receiver) = flume::unbounded();
        *self.shared.monitor.lock() = Some(sender);
        receiver
    }

    /// Route accepted children to workers chosen by `placement` instead of
    /// this listener's own worker.
    pub fn set_child_placement(&self, placement: ChildPlacement) {
        *self.shared.placement.lock() = Some(placement);
    }

    /// Bind to `endpoint` and begin listening.
    pub fn listen(&self, endpoint: &Endpoint) -> Result<()> {
        self.shared.listen(endpoint)
    }

    /// Submit an accept. Completes when an accepted connection is
    /// available, delivering the child socket.
    pub fn accept(&self, options: AcceptOptions, callback: AcceptCallback) -> Result<()> {
        self.shared.accept(options, callback)
    }

    /// Complete all pending accepts carrying `token` with `Cancelled`.
    pub fn cancel(&self, token: OperationToken) {
        self.shared.cancel(token);
    }

    /// Stop accepting, fail pending accepts, detach, and close the handle.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// The endpoint the listener is bound to.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.shared
            .state
            .lock()
            .local_endpoint
            .clone()
            .ok_or(Error::new(ErrorKind::Invalid))
    }

    /// The number of accepted connections not yet claimed by an accept.
    pub fn accept_queue_size(&self) -> usize {
        self.shared.state.lock().accept_queue.len()
    }

    /// The number of live child sockets produced by this listener.
    pub fn num_connections(&self) -> usize {
        self.shared.active_children.load(Ordering::Relaxed)
    }
}

impl ListenerShared {
    fn reactor(&self) -> Result<Arc<Reactor>> {
        self.reactor.upgrade().ok_or(Error::new(ErrorKind::Invalid))
    }

    fn announce(&self, event: ListenerEvent) {
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
        handler: impl Fn(&Arc<ListenerShared>) + Send + Sync + 'static,
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

    fn listen(self: &Arc<Self>, endpoint: &Endpoint) -> Result<()> {
        let reactor = self.reactor()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.listening || state.closed {
            return Err(Error::new(ErrorKind::Invalid));
        }

        let transport = Transport::for_endpoint(endpoint, true);
        let handle = syscall::create(transport)?;
        syscall::bind(&handle, endpoint, state.options.reuse_address)?;
        syscall::listen(&handle, state.options.backlog)?;
        state.local_endpoint = syscall::local_endpoint(&handle).ok();

        let mut context = FlowControlContext::default();
        state.flow.relax(&mut context, FlowControlType::Receive, false);

        let interest = InterestSet {
            want_readable: true,
            want_error: true,
            ..InterestSet::default()
        };
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let session: Arc<dyn ReactorSocket> =
                self.me.upgrade().ok_or(Error::new(ErrorKind::Invalid))?;
            let entry = reactor.attach_socket(handle.as_raw_fd(), interest, session)?;
            state.entry = Some(entry);
        }
        #[cfg(not(unix))]
        {
            let _ = interest;
            return Err(Error::new(ErrorKind::NotImplemented));
        }

        state.handle = Some(handle);
        state.listening = true;
        trace!(endpoint = %state.local_endpoint.as_ref().unwrap_or(endpoint), "listening");
        Ok(())
    }

    fn accept(self: &Arc<Self>, options: AcceptOptions, callback: AcceptCallback) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.listening || state.closed {
                return Err(Error::new(ErrorKind::Invalid));
            }

            if let Some((child, peer)) = state.accept_queue.pop_front() {
                self.complete_accept(state, child, peer, callback, &mut jobs);
                self.after_accept_queue_drained(state);
            } else {
                let id = state.next_accept_id;
                state.next_accept_id += 1;

                let timer = options.deadline.and_then(|deadline| {
                    let timer =
                        self.create_timer(move |shared| shared.handle_accept_deadline(id))?;
                    timer.schedule(deadline, None);
                    Some(timer)
                });

                state.pending_accepts.push_back(AcceptEntry {
                    id,
                    options,
                    callback: Some(callback),
                    timer,
                });
            }
        }
        self.dispatch(jobs);
        Ok(())
    }

    /// Build the child socket on its placed worker and schedule the
    /// completion callback.
    fn complete_accept(
        self: &Arc<Self>,
        state: &mut ListenerState,
        child: Socket,
        peer: Option<Endpoint>,
        callback: AcceptCallback,
        jobs: &mut Vec<Job>,
    ) {
        let child_reactor = self
            .placement
            .lock()
            .as_ref()
            .and_then(|placement| placement())
            .or_else(|| self.reactor().ok());
        let Some(child_reactor) = child_reactor else {
            let event = AcceptEvent {
                event_type: EventType::Error,
                context: AcceptContext {
                    endpoint: peer,
                    error: Some(Error::new(ErrorKind::Invalid)),
                },
            };
            jobs.push(Box::new(move || callback(event, None)));
            return;
        };

        let built = StreamSocket::from_accepted(
            &child_reactor,
            Arc::clone(&self.resolver),
            state.options.child_options.clone(),
            child,
            peer.clone(),
        );
        match built {
            Ok(socket) => {
                let counter = Arc::clone(&self.active_children);
                counter.fetch_add(1, Ordering::Relaxed);
                socket.set_on_closed(Box::new(move || {
                    counter.fetch_sub(1, Ordering::Relaxed);
                }));
                let event = AcceptEvent {
                    event_type: EventType::Complete,
                    context: AcceptContext {
                        endpoint: peer,
                        error: None,
                    },
                };
                jobs.push(Box::new(move || callback(event, Some(socket))));
            }
            Err(error) => {
                debug!(%error, "child socket construction failed");
                let event = AcceptEvent {
                    event_type: EventType::Error,
                    context: AcceptContext {
                        endpoint: peer,
                        error: Some(error),
                    },
                };
                jobs.push(Box::new(move || callback(event, None)));
            }
        }
    }

    /// The accept pump: drain the kernel backlog into the accept queue and
    /// satisfy pending accepts, honoring watermarks, the rate limiter, and
    /// the connection limit.
    fn pump(self: &Arc<Self>, state: &mut ListenerState, jobs: &mut Vec<Job>) {
        loop {
            if !state.flow.want_receive() || state.closed {
                return;
            }

            if state.accept_queue.len() >= state.options.accept_queue_high_watermark {
                if !state.above_high {
                    state.above_high = true;
                    self.announce(ListenerEvent::AcceptQueue(QueueEventType::HighWatermark));
                }
                let mut context = FlowControlContext::default();
                if state
                    .flow
                    .apply(&mut context, FlowControlType::Receive, false)
                {
                    self.announce(ListenerEvent::AcceptQueue(
                        QueueEventType::FlowControlApplied,
                    ));
                }
                self.sync_interest(state);
                return;
            }

            let now = Instant::now();
            if let Some(limiter) = state.accept_limiter.as_mut() {
                if limiter.would_overflow(1, now) {
                    self.apply_accept_rate_limit(state, now);
                    return;
                }
            }

            let outcome = {
                let handle = state.handle.as_ref().unwrap();
                syscall::accept(handle)
            };
            match outcome {
                Ok((child, peer)) => {
                    if let Some(limiter) = state.accept_limiter.as_mut() {
                        limiter.submit(1, now);
                    }
                    if let Some(limit) = state.options.max_connections {
                        let live = self.active_children.load(Ordering::Relaxed)
                            + state.accept_queue.len();
                        if live >= limit {
                            // Over the limit: close the connection outright.
                            trace!(?peer, limit, "connection rejected at limit");
                            drop(child);
                            self.announce(ListenerEvent::ConnectionRejectedLimitReached);
                            continue;
                        }
                    }
                    state.accept_queue.push_back((child, peer));
                    self.satisfy_pending_accepts(state, jobs);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) if error.kind() == ErrorKind::Limit => {
                    // Transient descriptor exhaustion; retry on the next
                    // readiness report.
                    warn!(%error, "accept failed");
                    break;
                }
                Err(error) => {
                    warn!(%error, "fatal listener error");
                    self.announce(ListenerEvent::Error(error));
                    self.begin_close(state, jobs);
                    return;
                }
            }
        }
    }

    fn satisfy_pending_accepts(self: &Arc<Self>, state: &mut ListenerState, jobs: &mut Vec<Job>) {
        while !state.pending_accepts.is_empty() && !state.accept_queue.is_empty() {
            let mut entry = state.pending_accepts.pop_front().unwrap();
            cancel_timer(&mut entry.timer);
            let (child, peer) = state.accept_queue.pop_front().unwrap();
            if let Some(callback) = entry.callback.take() {
                self.complete_accept(state, child, peer, callback, jobs);
            }
        }
        self.after_accept_queue_drained(state);
    }

    fn after_accept_queue_drained(self: &Arc<Self>, state: &mut ListenerState) {
        if state.above_high
            && state.accept_queue.len() <= state.options.accept_queue_low_watermark
        {
            state.above_high = false;
            self.announce(ListenerEvent::AcceptQueue(QueueEventType::LowWatermark));
            let mut context = FlowControlContext::default();
            if state
                .flow
                .relax(&mut context, FlowControlType::Receive, false)
            {
                self.announce(ListenerEvent::AcceptQueue(
                    QueueEventType::FlowControlRelaxed,
                ));
            }
            self.sync_interest(state);
        }
    }

    fn apply_accept_rate_limit(self: &Arc<Self>, state: &mut ListenerState, now: Instant) {
        let Some(limiter) = state.accept_limiter.as_mut() else {
            return;
        };
        let wait = limiter.calculate_time_to_submit(now);
        let mut context = FlowControlContext::default();
        if state
            .flow
            .apply(&mut context, FlowControlType::Receive, false)
        {
            self.announce(ListenerEvent::AcceptQueue(QueueEventType::RateLimitApplied));
        }
        self.sync_interest(state);

        if state.accept_rate_timer.is_none() {
            if let Some(timer) = self.create_timer(|shared| shared.relax_accept_rate_limit()) {
                timer.schedule(now + wait, None);
                state.accept_rate_timer = Some(timer);
            }
        }
    }

    fn relax_accept_rate_limit(self: &Arc<Self>) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.accept_rate_timer = None;
            let mut context = FlowControlContext::default();
            if state
                .flow
                .relax(&mut context, FlowControlType::Receive, false)
            {
                self.announce(ListenerEvent::AcceptQueue(QueueEventType::RateLimitRelaxed));
            }
            self.sync_interest(state);
            if state.listening && !state.closed {
                self.pump(state, &mut jobs);
            }
        }
        self.dispatch(jobs);
    }

    fn handle_accept_deadline(self: &Arc<Self>, id: u64) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let position = state
                .pending_accepts
                .iter()
                .position(|entry| entry.id == id);
            if let Some(index) = position {
                let mut entry = state.pending_accepts.remove(index).unwrap();
                cancel_timer(&mut entry.timer);
                if let Some(callback) = entry.callback.take() {
                    let event = AcceptEvent {
                        event_type: EventType::Error,
                        context: AcceptContext {
                            endpoint: None,
                            error: Some(Error::new(ErrorKind::Cancelled)),
                        },
                    };
                    jobs.push(Box::new(move || callback(event, None)));
                }
            }
        }
        self.dispatch(jobs);
    }

    fn cancel(self: &Arc<Self>, token: OperationToken) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut index = 0;
            while index < state.pending_accepts.len() {
                if state.pending_accepts[index].options.token == Some(token) {
                    let mut entry = state.pending_accepts.remove(index).unwrap();
                    cancel_timer(&mut entry.timer);
                    if let Some(callback) = entry.callback.take() {
                        let event = AcceptEvent {
                            event_type: EventType::Error,
                            context: AcceptContext {
                                endpoint: None,
                                error: Some(Error::new(ErrorKind::Cancelled)),
                            },
                        };
                        jobs.push(Box::new(move || callback(event, None)));
                    }
                } else {
                    index += 1;
                }
            }
        }
        self.dispatch(jobs);
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }
            self.announce(ListenerEvent::Shutdown(ShutdownEventType::Initiated));
            self.begin_close(state, &mut jobs);
        }
        self.dispatch(jobs);
        Ok(())
    }

    fn begin_close(self: &Arc<Self>, state: &mut ListenerState, jobs: &mut Vec<Job>) {
        if state.detach_started {
            return;
        }
        state.detach_started = true;
        state.closed = true;
        state.flow.close();
        cancel_timer(&mut state.accept_rate_timer);

        if !state.accept_queue.is_empty() {
            state.accept_queue.clear();
            self.announce(ListenerEvent::AcceptQueue(QueueEventType::Discarded));
        }
        while let Some(mut entry) = state.pending_accepts.pop_front() {
            cancel_timer(&mut entry.timer);
            if let Some(callback) = entry.callback.take() {
                let event = AcceptEvent {
                    event_type: EventType::Error,
                    context: AcceptContext {
                        endpoint: None,
                        error: Some(Error::new(ErrorKind::Cancelled)),
                    },
                };
                jobs.push(Box::new(move || callback(event, None)));
            }
        }

        match (state.entry.take(), self.reactor().ok()) {
            (Some(entry), Some(reactor)) => {
                let weak = self.me.clone();
                entry.set_detach_callback(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.finish_close();
                    }
                }));
                if let Err(error) = reactor.detach(&entry) {
                    debug!(%error, "listener detach");
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
            state.handle = None;
            state.entry = None;
            state.listening = false;
        }
        self.announce(ListenerEvent::Shutdown(ShutdownEventType::Complete));
    }

    fn sync_interest(&self, state: &mut ListenerState) {
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        let want_readable = state.flow.want_receive();
        reactor
            .modify_interest(entry, |interest| interest.want_readable = want_readable)
            .ok();
    }
}

impl ReactorSocket for ListenerShared {
    fn process_readable(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            if state.listening && !state.closed {
                this.pump(state, &mut jobs);
            }
        }
        this.dispatch(jobs);
    }

    fn process_writable(&self) {}

    fn process_error(&self, error: Error) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let latched = {
            let guard = this.state.lock();
            match guard.handle.as_ref() {
                Some(handle) => syscall::take_error(handle).ok().flatten(),
                None => None,
            }
        };
        let Some(error) = latched.or(Some(error)) else {
            return;
        };
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            if !state.closed {
                warn!(%error, "fatal listener error");
                this.announce(ListenerEvent::Error(error));
                this.begin_close(state, &mut jobs);
            }
        }
        this.dispatch(jobs);
    }
}

fn cancel_timer(slot: &mut Option<Arc<Timer>>) {
    if let Some(timer) = slot.take() {
        timer.cancel();
    }
}
