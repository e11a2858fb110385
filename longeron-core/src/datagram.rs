//! The asynchronous datagram socket.
//!
//! Message-oriented semantics: every send submits exactly one datagram and
//! every receive delivers exactly one, together with its delivery metadata
//! (sender endpoint, truncation, kernel receive timestamp). Datagram
//! sockets can be configured as multicast senders and receivers.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::buffer::{Blob, Data, SliceList};
use crate::chronology::{Job, Timer, TimerEvent, TimerOptions};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{
    DatagramEvent, QueueEventType, ReceiveCallback, ReceiveContext, ReceiveEvent, SendCallback,
    SendEvent, ShutdownEventType,
};
use crate::option::{DatagramSocketOptions, OperationToken, ReceiveOptions, SendOptions,
    SocketOption};
use crate::reactor::Reactor;
use crate::registry::{InterestSet, ReactorSocket, RegistryEntry};
use crate::state::{FlowControlContext, FlowControlState, FlowControlType};
use crate::strand::{Executor, Strand};
use crate::syscall::{self, Transport};

/// Received datagrams retained ahead of a receive submission; the oldest
/// is discarded beyond this.
const MAX_QUEUED_DATAGRAMS: usize = 1024;

struct SendMessage {
    id: u64,
    payload: Bytes,
    endpoint: Option<Endpoint>,
    callback: Option<SendCallback>,
    token: Option<OperationToken>,
    timer: Option<Arc<Timer>>,
    zero_copy: bool,
}

struct PendingReceive {
    id: u64,
    options: ReceiveOptions,
    callback: Option<ReceiveCallback>,
    timer: Option<Arc<Timer>>,
}

struct DatagramState {
    options: DatagramSocketOptions,
    transport: Option<Transport>,
    handle: Option<Socket>,
    entry: Option<Arc<RegistryEntry>>,
    flow: FlowControlState,
    write_queue: VecDeque<SendMessage>,
    write_size: usize,
    write_above_high: bool,
    next_send_id: u64,
    receive_queue: VecDeque<(Blob, ReceiveContext)>,
    pending_receives: VecDeque<PendingReceive>,
    next_receive_id: u64,
    read_scratch: Vec<u8>,
    last_writable: bool,
    closed: bool,
    detach_started: bool,
    local_endpoint: Option<Endpoint>,
    peer_endpoint: Option<Endpoint>,
}

pub(crate) struct DatagramShared {
    me: Weak<DatagramShared>,
    reactor: Weak<Reactor>,
    strand: Arc<Strand>,
    monitor: Mutex<Option<flume::Sender<DatagramEvent>>>,
    state: Mutex<DatagramState>,
}

/// An asynchronous, callback-driven datagram socket bound to one worker.
#[derive(Clone)]
pub struct DatagramSocket {
    shared: Arc<DatagramShared>,
}

impl DatagramSocket {
    /// Create a socket bound to `reactor`.
    pub fn new(reactor: &Arc<Reactor>, options: DatagramSocketOptions) -> Self {
        let executor: Arc<dyn Executor> = reactor.clone();
        let strand = Strand::new(executor);
        let read_scratch = vec![0u8; options.max_datagram_size.max(1)];
        let shared = Arc::new_cyclic(|me| DatagramShared {
            me: me.clone(),
            reactor: Arc::downgrade(reactor),
            strand,
            monitor: Mutex::new(None),
            state: Mutex::new(DatagramState {
                options,
                transport: None,
                handle: None,
                entry: None,
                flow: FlowControlState::new(),
                write_queue: VecDeque::new(),
                write_size: 0,
                write_above_high: false,
                next_send_id: 0,
                receive_queue: VecDeque::new(),
                pending_receives: VecDeque::new(),
                next_receive_id: 0,
                read_scratch,
                last_writable: false,
                closed: false,
                detach_started: false,
                local_endpoint: None,
                peer_endpoint: None,
            }),
        });
        Self { shared }
    }

    /// A channel of this socket's advisory events.
    pub fn monitor(&self) -> flume::Receiver<DatagramEvent> {
        let (sender, receiver) = flume::unbounded();
        *self.shared.monitor.lock() = Some(sender);
        receiver
    }

    /// Allocate the handle for `transport` and attach it to the worker.
    pub fn open(&self, transport: Transport) -> Result<()> {
        self.shared.open(transport)
    }

    /// Bind the handle to `endpoint` and begin delivering datagrams.
    pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        self.shared.bind(endpoint)
    }

    /// Fix the default destination; subsequent sends may omit an endpoint.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.shared.connect(endpoint)
    }

    /// Submit one datagram. The options may carry the destination, an
    /// explicit multicast source, a TTL override, and a zero-copy flag.
    pub fn send(
        &self,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        self.shared.send(data, options, callback)
    }

    /// Submit a receive for a single datagram.
    pub fn receive(&self, options: ReceiveOptions, callback: ReceiveCallback) -> Result<()> {
        self.shared.receive(options, callback)
    }

    /// Complete all pending operations carrying `token` with `Cancelled`.
    pub fn cancel(&self, token: OperationToken) {
        self.shared.cancel(token);
    }

    /// Detach and close the handle.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Join the multicast `group` on `interface`.
    pub fn join_multicast_group(&self, interface: IpAddr, group: IpAddr) -> Result<()> {
        let guard = self.shared.state.lock();
        let handle = guard.handle.as_ref().ok_or(Error::new(ErrorKind::Invalid))?;
        syscall::join_multicast_group(handle, interface, group)
    }

    /// Leave the multicast `group` on `interface`.
    pub fn leave_multicast_group(&self, interface: IpAddr, group: IpAddr) -> Result<()> {
        let guard = self.shared.state.lock();
        let handle = guard.handle.as_ref().ok_or(Error::new(ErrorKind::Invalid))?;
        syscall::leave_multicast_group(handle, interface, group)
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

    /// The number of bytes queued for transmission.
    pub fn write_queue_size(&self) -> usize {
        self.shared.state.lock().write_size
    }
}

impl DatagramShared {
    fn reactor(&self) -> Result<Arc<Reactor>> {
        self.reactor.upgrade().ok_or(Error::new(ErrorKind::Invalid))
    }

    fn announce(&self, event: DatagramEvent) {
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
        handler: impl Fn(&Arc<DatagramShared>) + Send + Sync + 'static,
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

    fn open(self: &Arc<Self>, transport: Transport) -> Result<()> {
        if !transport.is_datagram() {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let reactor = self.reactor()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.handle.is_some() || state.closed {
            return Err(Error::new(ErrorKind::Invalid));
        }

        let handle = syscall::create(transport)?;
        let ipv6 = matches!(transport, Transport::UdpIpv6Datagram);
        if state.options.reuse_address {
            syscall::set_option(&handle, &SocketOption::ReuseAddress(true)).ok();
        }
        if let Some(ttl) = state.options.multicast_ttl {
            syscall::set_multicast_ttl(&handle, ipv6, ttl).ok();
        }
        if let Some(loopback) = state.options.multicast_loopback {
            syscall::set_multicast_loopback(&handle, ipv6, loopback).ok();
        }
        if let Some(interface) = state.options.multicast_interface {
            syscall::set_multicast_interface(&handle, interface).ok();
        }
        if state.options.timestamp_incoming_data {
            if let Err(error) = syscall::set_option(&handle, &SocketOption::RxTimestamping(true)) {
                debug!(%error, "receive timestamping unavailable");
            }
        }
        for option in state.options.socket_options.clone() {
            if let Err(error) = syscall::set_option(&handle, &option) {
                debug!(%error, ?option, "socket option rejected");
            }
        }

        let mut context = FlowControlContext::default();
        state.flow.relax(&mut context, FlowControlType::Both, false);

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let session: Arc<dyn ReactorSocket> =
                self.me.upgrade().ok_or(Error::new(ErrorKind::Invalid))?;
            let entry =
                reactor.attach_socket(handle.as_raw_fd(), InterestSet::none(), session)?;
            state.entry = Some(entry);
        }
        #[cfg(not(unix))]
        {
            return Err(Error::new(ErrorKind::NotImplemented));
        }

        state.transport = Some(transport);
        state.handle = Some(handle);
        Ok(())
    }

    fn bind(self: &Arc<Self>, endpoint: &Endpoint) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let handle = state.handle.as_ref().ok_or(Error::new(ErrorKind::Invalid))?;
        syscall::bind(handle, endpoint, state.options.reuse_address)?;
        state.local_endpoint = syscall::local_endpoint(handle).ok();
        self.show_readable(state);
        Ok(())
    }

    fn connect(self: &Arc<Self>, endpoint: &Endpoint) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let handle = state.handle.as_ref().ok_or(Error::new(ErrorKind::Invalid))?;
        syscall::connect(handle, endpoint)?;
        state.local_endpoint = syscall::local_endpoint(handle).ok();
        state.peer_endpoint = Some(endpoint.clone());
        self.show_readable(state);
        Ok(())
    }

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
            if state.handle.is_none() || state.closed || state.flow.lock_send() {
                return Err(Error::new(ErrorKind::Invalid));
            }
            if options.endpoint.is_none() && state.peer_endpoint.is_none() {
                return Err(Error::new(ErrorKind::Invalid));
            }

            // One submission is one datagram, staged contiguously.
            let payload = flatten(&data);
            let length = payload.len();
            if length > state.options.max_datagram_size {
                return Err(Error::new(ErrorKind::Limit));
            }

            let enqueued = state.write_size + length;
            let high = state.options.write_queue_high_watermark;
            if enqueued >= high && !state.write_above_high {
                state.write_above_high = true;
                self.announce(DatagramEvent::WriteQueue(QueueEventType::HighWatermark));
            }
            if enqueued > high && !options.suppress_high_watermark {
                return Err(Error::new(ErrorKind::WouldFlowControl));
            }

            if let Some(source) = options.source {
                if let Some(handle) = state.handle.as_ref() {
                    syscall::set_multicast_interface(handle, source).ok();
                }
            }
            if let Some(ttl) = options.ttl {
                let ipv6 = matches!(state.transport, Some(Transport::UdpIpv6Datagram));
                if let Some(handle) = state.handle.as_ref() {
                    syscall::set_multicast_ttl(handle, ipv6, ttl).ok();
                }
            }

            let id = state.next_send_id;
            state.next_send_id += 1;
            let timer = options.deadline.and_then(|deadline| {
                let timer = self.create_timer(move |shared| shared.handle_send_deadline(id))?;
                timer.schedule(deadline, None);
                Some(timer)
            });

            state.write_queue.push_back(SendMessage {
                id,
                payload,
                endpoint: options.endpoint.clone(),
                callback,
                token: options.token,
                timer,
                zero_copy: options.zero_copy,
            });
            state.write_size += length;

            if state.last_writable {
                self.drain(state, &mut jobs);
            } else {
                self.show_writable(state);
            }
            Ok(())
        };
        self.dispatch(jobs);
        result
    }

    fn drain(self: &Arc<Self>, state: &mut DatagramState, jobs: &mut Vec<Job>) {
        loop {
            if !state.flow.want_send() || state.closed {
                return;
            }
            let Some(message) = state.write_queue.front() else {
                break;
            };

            let outcome = {
                let handle = state.handle.as_ref().unwrap();
                syscall::send_to(
                    handle,
                    &message.payload,
                    message.endpoint.as_ref(),
                    message.zero_copy,
                )
            };
            match outcome {
                Ok(sent) => {
                    let mut message = state.write_queue.pop_front().unwrap();
                    state.write_size -= message.payload.len().min(state.write_size);
                    cancel_timer(&mut message.timer);
                    if let Some(callback) = message.callback.take() {
                        let event = SendEvent::complete(sent, false);
                        jobs.push(Box::new(move || callback(event)));
                    }
                    if state.write_size <= state.options.write_queue_low_watermark
                        && state.write_above_high
                    {
                        state.write_above_high = false;
                        self.announce(DatagramEvent::WriteQueue(QueueEventType::LowWatermark));
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    self.show_writable(state);
                    return;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    // One undeliverable datagram fails its own submission
                    // only.
                    debug!(%error, "datagram send failed");
                    let mut message = state.write_queue.pop_front().unwrap();
                    state.write_size -= message.payload.len().min(state.write_size);
                    cancel_timer(&mut message.timer);
                    if let Some(callback) = message.callback.take() {
                        let event = SendEvent::error(error);
                        jobs.push(Box::new(move || callback(event)));
                    }
                }
            }
        }

        if state.write_queue.is_empty() {
            self.hide_writable(state);
        }
    }

    fn receive(self: &Arc<Self>, options: ReceiveOptions, callback: ReceiveCallback) -> Result<()> {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.handle.is_none() || state.closed {
                return Err(Error::new(ErrorKind::Invalid));
            }

            if let Some((blob, context)) = state.receive_queue.pop_front() {
                let event = ReceiveEvent::complete(blob, context);
                jobs.push(Box::new(move || callback(event)));
            } else {
                let id = state.next_receive_id;
                state.next_receive_id += 1;
                let timer = options.deadline.and_then(|deadline| {
                    let timer =
                        self.create_timer(move |shared| shared.handle_receive_deadline(id))?;
                    timer.schedule(deadline, None);
                    Some(timer)
                });
                state.pending_receives.push_back(PendingReceive {
                    id,
                    options,
                    callback: Some(callback),
                    timer,
                });
                self.show_readable(state);
            }
        }
        self.dispatch(jobs);
        Ok(())
    }

    fn fill(self: &Arc<Self>, state: &mut DatagramState, jobs: &mut Vec<Job>) {
        loop {
            if !state.flow.want_receive() || state.closed {
                return;
            }

            let mut scratch = std::mem::take(&mut state.read_scratch);
            let outcome = {
                let handle = state.handle.as_ref().unwrap();
                receive_one(handle, &mut scratch)
            };
            let (received, meta) = match outcome {
                Ok(result) => result,
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    state.read_scratch = scratch;
                    break;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {
                    state.read_scratch = scratch;
                    continue;
                }
                Err(error) => {
                    state.read_scratch = scratch;
                    warn!(%error, "fatal datagram error");
                    self.announce(DatagramEvent::Error(error));
                    self.begin_close(state, jobs);
                    return;
                }
            };

            let mut blob = Blob::with_segment_size(state.options.max_datagram_size.max(1));
            blob.write(&scratch[..received]);
            state.read_scratch = scratch;

            let context = ReceiveContext {
                endpoint: state.local_endpoint.clone(),
                foreign_endpoint: meta.endpoint.or_else(|| state.peer_endpoint.clone()),
                truncated: meta.truncated,
                timestamp: meta.timestamp,
                error: None,
            };
            trace!(bytes = received, truncated = context.truncated, "datagram received");

            if let Some(mut pending) = state.pending_receives.pop_front() {
                cancel_timer(&mut pending.timer);
                if let Some(callback) = pending.callback.take() {
                    let event = ReceiveEvent::complete(blob, context);
                    jobs.push(Box::new(move || callback(event)));
                }
            } else {
                if state.receive_queue.len() == MAX_QUEUED_DATAGRAMS {
                    state.receive_queue.pop_front();
                    self.announce(DatagramEvent::ReadQueue(QueueEventType::Discarded));
                }
                state.receive_queue.push_back((blob, context));
            }
        }
    }

    fn handle_send_deadline(self: &Arc<Self>, id: u64) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(index) = state.write_queue.iter().position(|entry| entry.id == id) {
                let mut message = state.write_queue.remove(index).unwrap();
                state.write_size -= message.payload.len().min(state.write_size);
                cancel_timer(&mut message.timer);
                if let Some(callback) = message.callback.take() {
                    let event = SendEvent::error(Error::new(ErrorKind::Cancelled));
                    jobs.push(Box::new(move || callback(event)));
                }
            }
        }
        self.dispatch(jobs);
    }

    fn handle_receive_deadline(self: &Arc<Self>, id: u64) {
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(index) = state
                .pending_receives
                .iter()
                .position(|entry| entry.id == id)
            {
                let mut pending = state.pending_receives.remove(index).unwrap();
                cancel_timer(&mut pending.timer);
                if let Some(callback) = pending.callback.take() {
                    let event = ReceiveEvent::error(Error::new(ErrorKind::Cancelled));
                    jobs.push(Box::new(move || callback(event)));
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
            while index < state.write_queue.len() {
                if state.write_queue[index].token == Some(token) {
                    let mut message = state.write_queue.remove(index).unwrap();
                    state.write_size -= message.payload.len().min(state.write_size);
                    cancel_timer(&mut message.timer);
                    if let Some(callback) = message.callback.take() {
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
                    let mut pending = state.pending_receives.remove(index).unwrap();
                    cancel_timer(&mut pending.timer);
                    if let Some(callback) = pending.callback.take() {
                        let event = ReceiveEvent::error(Error::new(ErrorKind::Cancelled));
                        jobs.push(Box::new(move || callback(event)));
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
            self.announce(DatagramEvent::Shutdown(ShutdownEventType::Initiated));
            self.begin_close(state, &mut jobs);
        }
        self.dispatch(jobs);
        Ok(())
    }

    fn begin_close(self: &Arc<Self>, state: &mut DatagramState, jobs: &mut Vec<Job>) {
        if state.detach_started {
            return;
        }
        state.detach_started = true;
        state.closed = true;
        state.flow.close();

        while let Some(mut message) = state.write_queue.pop_front() {
            cancel_timer(&mut message.timer);
            if let Some(callback) = message.callback.take() {
                let event = SendEvent::error(Error::new(ErrorKind::Cancelled));
                jobs.push(Box::new(move || callback(event)));
            }
        }
        state.write_size = 0;

        while let Some(mut pending) = state.pending_receives.pop_front() {
            cancel_timer(&mut pending.timer);
            if let Some(callback) = pending.callback.take() {
                let event = ReceiveEvent::error(Error::new(ErrorKind::Cancelled));
                jobs.push(Box::new(move || callback(event)));
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
                    debug!(%error, "datagram detach");
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
        }
        self.announce(DatagramEvent::Shutdown(ShutdownEventType::Complete));
    }

    fn show_readable(&self, state: &mut DatagramState) {
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        if state.flow.want_receive() {
            reactor
                .modify_interest(entry, |interest| interest.want_readable = true)
                .ok();
        }
    }

    fn show_writable(&self, state: &mut DatagramState) {
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

    fn hide_writable(&self, state: &mut DatagramState) {
        let (Some(entry), Ok(reactor)) = (state.entry.as_ref(), self.reactor()) else {
            return;
        };
        reactor
            .modify_interest(entry, |interest| interest.want_writable = false)
            .ok();
    }
}

impl ReactorSocket for DatagramShared {
    fn process_readable(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            if state.handle.is_some() && !state.closed {
                this.fill(state, &mut jobs);
            }
        }
        this.dispatch(jobs);
    }

    fn process_writable(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut guard = this.state.lock();
            let state = &mut *guard;
            state.last_writable = true;
            if state.handle.is_some() && !state.closed {
                this.drain(state, &mut jobs);
            }
        }
        this.dispatch(jobs);
    }

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
        let error = latched.unwrap_or(error);
        // Datagram transports surface per-destination errors (refused
        // ports, unreachable hosts) without killing the socket.
        debug!(%error, "datagram error report");
    }
}

#[cfg(unix)]
fn receive_one(handle: &Socket, scratch: &mut [u8]) -> Result<(usize, syscall::ReceiveMeta)> {
    syscall::receive_message(handle, scratch)
}

#[cfg(not(unix))]
fn receive_one(handle: &Socket, scratch: &mut [u8]) -> Result<(usize, syscall::ReceiveMeta)> {
    let received = syscall::receive(handle, scratch)?;
    Ok((received, syscall::ReceiveMeta::default()))
}

/// Stage the submitted data as one contiguous datagram payload.
fn flatten(data: &Data) -> Bytes {
    let mut slices = SliceList::new();
    data.gather(0, &mut slices);
    if slices.len() == 1 {
        return Bytes::copy_from_slice(slices[0]);
    }
    let mut payload = Vec::with_capacity(data.len());
    for slice in &slices {
        payload.extend_from_slice(slice);
    }
    Bytes::from(payload)
}

fn cancel_timer(slot: &mut Option<Arc<Timer>>) {
    if let Some(timer) = slot.take() {
        timer.cancel();
    }
}
