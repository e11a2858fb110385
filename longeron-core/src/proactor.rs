//! The completion-based demultiplexer engine.
//!
//! Where the reactor signals that a handle is ready for a non-blocking
//! attempt, a [`Proactor`] accepts whole operations up front and reports
//! their results: an accept completes with the accepted handle, a connect
//! with establishment, a send with the bytes transferred, a receive with
//! the filled buffer. Sockets attach a [`ProactorSocket`] session and
//! detach through the same reference-counted protocol as the reactor, so
//! no completion is ever delivered to a torn-down socket.
//!
//! The shipped [`SynchronousBackend`] performs submissions with the
//! syscall facade during `wait`, retrying would-block attempts between
//! cycles; kernel completion rings (io_uring, I/O completion ports) plug
//! in behind the same [`CompletionBackend`] contract.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::chronology::{Chronology, Job};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{DetachContext, DetachProgress};
use crate::strand::Executor;
use crate::syscall;

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// The longest a `wait` may block before re-checking for shutdown.
const MAX_WAIT: Duration = Duration::from_millis(250);

/// How long the synchronous backend pauses between retry passes over
/// submissions the kernel refused with would-block.
#[cfg(unix)]
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// One operation queued against a handle.
#[derive(Debug)]
pub enum Submission {
    /// Accept one pending connection.
    Accept,
    /// Establish a connection to `endpoint`.
    Connect {
        /// The peer to connect to.
        endpoint: Endpoint,
    },
    /// Transmit `data`.
    Send {
        /// The bytes to transmit.
        data: Bytes,
    },
    /// Receive up to the buffer's length.
    Receive {
        /// The buffer the kernel fills.
        buffer: Vec<u8>,
    },
}

/// The result a completed operation carries.
pub enum CompletionKind {
    /// An accept finished with the accepted handle and its peer endpoint.
    Accepted(Result<(Socket, Option<Endpoint>)>),
    /// A connect finished.
    Connected(Result<()>),
    /// A send finished with the bytes transferred.
    Sent(Result<usize>),
    /// A receive finished with the filled buffer; an empty buffer reports
    /// end-of-file on a stream transport.
    Received(Result<Vec<u8>>),
}

impl std::fmt::Debug for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted(result) => write!(f, "Accepted({})", result.is_ok()),
            Self::Connected(result) => write!(f, "Connected({})", result.is_ok()),
            Self::Sent(result) => write!(f, "Sent({result:?})"),
            Self::Received(result) => {
                write!(f, "Received({:?})", result.as_ref().map(|data| data.len()))
            }
        }
    }
}

/// One completion report from a completion backend.
#[derive(Debug)]
pub struct Completion {
    /// The registry token the report belongs to.
    pub token: usize,
    /// The operation's result.
    pub kind: CompletionKind,
}

/// One OS completion mechanism behind the proactor.
pub trait CompletionBackend: Send + Sync {
    /// The backend's name, as registered with the driver registry.
    fn name(&self) -> &'static str;

    /// Queue `submission` against `handle` under `token`.
    #[cfg(unix)]
    fn submit(&self, handle: RawFd, token: usize, submission: Submission) -> Result<()>;

    /// Discard queued submissions for `token`; their completions are never
    /// delivered.
    fn retire(&self, token: usize);

    /// Block up to `timeout` for completion reports, appending them to
    /// `completions`.
    fn wait(&self, completions: &mut Vec<Completion>, timeout: Option<Duration>) -> Result<()>;

    /// Interrupt a concurrent `wait`.
    fn wake(&self) -> Result<()>;
}

/// The hooks a socket registers to consume proactor completions.
pub trait ProactorSocket: Send + Sync {
    /// An accept submission completed.
    fn process_accepted(&self, result: Result<(Socket, Option<Endpoint>)>);

    /// A connect submission completed.
    fn process_connected(&self, result: Result<()>);

    /// A send submission completed with the bytes transferred.
    fn process_sent(&self, result: Result<usize>);

    /// A receive submission completed with the filled buffer.
    fn process_received(&self, result: Result<Vec<u8>>);

    /// The handle's error queue holds notifications (zero-copy
    /// acknowledgements, transmit timestamps).
    fn process_notifications(&self) {}
}

#[cfg(unix)]
enum Pending {
    Work(Work),
    Wake,
}

#[cfg(unix)]
struct Work {
    handle: RawFd,
    token: usize,
    submission: Submission,
}

#[cfg(unix)]
enum Attempt {
    Complete(Completion),
    Retry(Work),
}

/// A completion backend that performs submissions with the syscall facade
/// during `wait`, retrying would-block attempts between cycles.
#[cfg(unix)]
pub struct SynchronousBackend {
    submissions: flume::Sender<Pending>,
    incoming: flume::Receiver<Pending>,
    retired: Mutex<HashSet<usize>>,
}

#[cfg(unix)]
impl SynchronousBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (submissions, incoming) = flume::unbounded();
        Self {
            submissions,
            incoming,
            retired: Mutex::new(HashSet::new()),
        }
    }

    fn attempt(work: Work) -> Attempt {
        let Work {
            handle,
            token,
            submission,
        } = work;

        match submission {
            Submission::Accept => {
                match syscall::with_borrowed(handle, syscall::accept) {
                    Ok(accepted) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Accepted(Ok(accepted)),
                    }),
                    Err(error) if error.is_retryable() => Attempt::Retry(Work {
                        handle,
                        token,
                        submission: Submission::Accept,
                    }),
                    Err(error) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Accepted(Err(error)),
                    }),
                }
            }
            Submission::Connect { endpoint } => {
                let outcome =
                    syscall::with_borrowed(handle, |socket| syscall::connect(socket, &endpoint));
                match outcome {
                    Ok(()) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Connected(Ok(())),
                    }),
                    // A connect in flight answers `EALREADY` to re-issues
                    // and `EISCONN` once established.
                    Err(error)
                        if error.kind() == ErrorKind::Pending
                            || error.code() == Some(libc::EALREADY) =>
                    {
                        Attempt::Retry(Work {
                            handle,
                            token,
                            submission: Submission::Connect { endpoint },
                        })
                    }
                    Err(error) if error.code() == Some(libc::EISCONN) => {
                        Attempt::Complete(Completion {
                            token,
                            kind: CompletionKind::Connected(Ok(())),
                        })
                    }
                    Err(error) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Connected(Err(error)),
                    }),
                }
            }
            Submission::Send { data } => {
                let outcome = syscall::with_borrowed(handle, |socket| {
                    syscall::send_vectored(socket, &[std::io::IoSlice::new(&data)], false)
                });
                match outcome {
                    Ok(sent) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Sent(Ok(sent)),
                    }),
                    Err(error) if error.is_retryable() => Attempt::Retry(Work {
                        handle,
                        token,
                        submission: Submission::Send { data },
                    }),
                    Err(error) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Sent(Err(error)),
                    }),
                }
            }
            Submission::Receive { mut buffer } => {
                let outcome =
                    syscall::with_borrowed(handle, |socket| syscall::receive(socket, &mut buffer));
                match outcome {
                    Ok(received) => {
                        buffer.truncate(received);
                        Attempt::Complete(Completion {
                            token,
                            kind: CompletionKind::Received(Ok(buffer)),
                        })
                    }
                    Err(error) if error.is_retryable() => Attempt::Retry(Work {
                        handle,
                        token,
                        submission: Submission::Receive { buffer },
                    }),
                    Err(error) => Attempt::Complete(Completion {
                        token,
                        kind: CompletionKind::Received(Err(error)),
                    }),
                }
            }
        }
    }
}

#[cfg(unix)]
impl Default for SynchronousBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl CompletionBackend for SynchronousBackend {
    fn name(&self) -> &'static str {
        "synchronous"
    }

    fn submit(&self, handle: RawFd, token: usize, submission: Submission) -> Result<()> {
        self.submissions
            .send(Pending::Work(Work {
                handle,
                token,
                submission,
            }))
            .map_err(|_| Error::new(ErrorKind::Invalid))
    }

    fn retire(&self, token: usize) {
        self.retired.lock().insert(token);
    }

    fn wait(&self, completions: &mut Vec<Completion>, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut retry: Vec<Work> = Vec::new();

        loop {
            let first = if retry.is_empty() {
                match deadline {
                    Some(deadline) => self.incoming.recv_deadline(deadline).ok(),
                    None => self.incoming.recv().ok(),
                }
            } else {
                self.incoming.try_recv().ok()
            };

            let mut woke = false;
            let mut batch = Vec::new();
            if let Some(first) = first {
                batch.push(first);
            }
            batch.extend(self.incoming.try_iter());
            for pending in batch {
                match pending {
                    Pending::Wake => woke = true,
                    Pending::Work(work) => retry.push(work),
                }
            }

            let mut unfinished = Vec::new();
            for work in retry.drain(..) {
                // A retired token's queued work dies with its socket.
                if self.retired.lock().contains(&work.token) {
                    continue;
                }
                match Self::attempt(work) {
                    Attempt::Complete(completion) => completions.push(completion),
                    Attempt::Retry(work) => unfinished.push(work),
                }
            }
            retry = unfinished;

            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if !completions.is_empty() || woke || expired {
                for work in retry {
                    self.submissions.send(Pending::Work(work)).ok();
                }
                return Ok(());
            }
            if !retry.is_empty() {
                // A stub polls; real completion rings park in the kernel.
                std::thread::sleep(RETRY_PAUSE);
            }
        }
    }

    fn wake(&self) -> Result<()> {
        self.submissions
            .send(Pending::Wake)
            .map_err(|_| Error::new(ErrorKind::Invalid))
    }
}

/// Per-handle state owned by a proactor.
pub struct ProactorEntry {
    token: usize,
    #[cfg(unix)]
    handle: RawFd,
    socket: Mutex<Option<Arc<dyn ProactorSocket>>>,
    detach: DetachContext,
    detach_callback: Mutex<Option<Job>>,
}

impl ProactorEntry {
    /// The registry token of this entry.
    #[must_use]
    pub fn token(&self) -> usize {
        self.token
    }

    /// The OS handle of this entry.
    #[cfg(unix)]
    #[must_use]
    pub fn handle(&self) -> RawFd {
        self.handle
    }

    /// The detach context guarding this entry.
    #[must_use]
    pub fn detach_context(&self) -> &DetachContext {
        &self.detach
    }

    /// Store the function to invoke when detachment completes.
    pub fn set_detach_callback(&self, callback: Job) {
        *self.detach_callback.lock() = Some(callback);
    }

    /// Take the detach callback, if still present.
    pub(crate) fn take_detach_callback(&self) -> Option<Job> {
        self.detach_callback.lock().take()
    }

    fn socket(&self) -> Option<Arc<dyn ProactorSocket>> {
        self.socket.lock().clone()
    }

    fn clear_sinks(&self) {
        *self.socket.lock() = None;
    }
}

impl std::fmt::Debug for Proactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proactor").field("name", &self.name).finish()
    }
}

/// A completion-based demultiplexer bound to one worker.
pub struct Proactor {
    name: String,
    backend: Box<dyn CompletionBackend>,
    chronology: Arc<Chronology>,
    catalog: Mutex<HashMap<usize, Arc<ProactorEntry>>>,
    next_token: AtomicUsize,
    running: AtomicBool,
}

impl Proactor {
    /// Create a proactor over `backend`.
    pub fn with_backend(name: impl Into<String>, backend: Box<dyn CompletionBackend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backend,
            chronology: Chronology::new(),
            catalog: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            running: AtomicBool::new(false),
        })
    }

    /// Create a proactor over the synchronous completion backend.
    #[cfg(unix)]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_backend(name, Box::new(SynchronousBackend::new()))
    }

    /// The proactor's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chronology owned by this proactor's worker.
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

    /// Attach a socket session for `handle`.
    #[cfg(unix)]
    pub fn attach_socket(
        &self,
        handle: RawFd,
        socket: Arc<dyn ProactorSocket>,
    ) -> Result<Arc<ProactorEntry>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ProactorEntry {
            token,
            handle,
            socket: Mutex::new(Some(socket)),
            detach: DetachContext::new(),
            detach_callback: Mutex::new(None),
        });
        self.catalog.lock().insert(token, Arc::clone(&entry));
        trace!(proactor = %self.name, token, handle, "attach");
        Ok(entry)
    }

    /// Queue `submission` against `entry`'s handle; the result is delivered
    /// to the entry's session.
    #[cfg(unix)]
    pub fn submit(&self, entry: &Arc<ProactorEntry>, submission: Submission) -> Result<()> {
        if entry.detach_context().is_detached() {
            return Err(Error::new(ErrorKind::Invalid));
        }
        self.backend.submit(entry.handle(), entry.token(), submission)
    }

    /// Request detachment of `entry`. Queued submissions are discarded and
    /// the entry's detach callback runs on this proactor's worker exactly
    /// once, after in-flight deliveries drain.
    pub fn detach(&self, entry: &Arc<ProactorEntry>) -> Result<()> {
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

    fn complete_detach(&self, entry: &Arc<ProactorEntry>) {
        self.backend.retire(entry.token());
        self.catalog.lock().remove(&entry.token());
        trace!(proactor = %self.name, token = entry.token(), "detached");
        if let Some(callback) = entry.take_detach_callback() {
            self.chronology.execute(callback);
            self.backend.wake().ok();
        }
        entry.clear_sinks();
    }

    /// Run one demultiplexing cycle: wait up to the earliest deadline (or
    /// `cap`), dispatch completions, then announce due timers and deferred
    /// functions. Returns the number of completions dispatched.
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

        let mut completions = Vec::new();
        self.backend.wait(&mut completions, Some(timeout))?;

        let dispatched = completions.len();
        for completion in completions {
            self.dispatch(completion);
        }

        self.chronology.announce(Instant::now(), false);
        Ok(dispatched)
    }

    /// Run demultiplexing cycles until [`stop`](Self::stop) is called.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        debug!(proactor = %self.name, "running");
        while self.running.load(Ordering::Acquire) {
            if let Err(error) = self.drive(None) {
                warn!(proactor = %self.name, %error, "drive failed");
                break;
            }
        }
        debug!(proactor = %self.name, "stopped");
    }

    /// Request that [`run`](Self::run) return after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.backend.wake().ok();
    }

    fn dispatch(&self, completion: Completion) {
        let entry = {
            let catalog = self.catalog.lock();
            match catalog.get(&completion.token) {
                Some(entry) => Arc::clone(entry),
                None => return,
            }
        };

        // Acquire a delivery reference; failure means the socket is tearing
        // down and the completion is discarded.
        if !entry.detach_context().increment_reference() {
            return;
        }

        if let Some(socket) = entry.socket() {
            match completion.kind {
                CompletionKind::Accepted(result) => socket.process_accepted(result),
                CompletionKind::Connected(result) => socket.process_connected(result),
                CompletionKind::Sent(result) => socket.process_sent(result),
                CompletionKind::Received(result) => socket.process_received(result),
            }
        }

        if entry.detach_context().decrement_reference() {
            self.complete_detach(&entry);
        }
    }
}

impl Executor for Proactor {
    fn execute(&self, job: Job) {
        self.chronology.execute(job);
        self.backend.wake().ok();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::syscall::Transport;
    use std::io::{Read as _, Write as _};
    use std::net::Ipv4Addr;
    use std::os::unix::io::AsRawFd;

    struct RecordingSession {
        accepted: flume::Sender<Result<(Socket, Option<Endpoint>)>>,
        connected: flume::Sender<Result<()>>,
        sent: flume::Sender<Result<usize>>,
        received: flume::Sender<Result<Vec<u8>>>,
    }

    struct RecordingChannels {
        accepted: flume::Receiver<Result<(Socket, Option<Endpoint>)>>,
        connected: flume::Receiver<Result<()>>,
        sent: flume::Receiver<Result<usize>>,
        received: flume::Receiver<Result<Vec<u8>>>,
    }

    fn recording_session() -> (Arc<RecordingSession>, RecordingChannels) {
        let (accepted_tx, accepted_rx) = flume::unbounded();
        let (connected_tx, connected_rx) = flume::unbounded();
        let (sent_tx, sent_rx) = flume::unbounded();
        let (received_tx, received_rx) = flume::unbounded();
        (
            Arc::new(RecordingSession {
                accepted: accepted_tx,
                connected: connected_tx,
                sent: sent_tx,
                received: received_tx,
            }),
            RecordingChannels {
                accepted: accepted_rx,
                connected: connected_rx,
                sent: sent_rx,
                received: received_rx,
            },
        )
    }

    impl ProactorSocket for RecordingSession {
        fn process_accepted(&self, result: Result<(Socket, Option<Endpoint>)>) {
            self.accepted.send(result).ok();
        }

        fn process_connected(&self, result: Result<()>) {
            self.connected.send(result).ok();
        }

        fn process_sent(&self, result: Result<usize>) {
            self.sent.send(result).ok();
        }

        fn process_received(&self, result: Result<Vec<u8>>) {
            self.received.send(result).ok();
        }
    }

    fn drive_until(proactor: &Proactor, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "proactor did not converge");
            proactor.drive(Some(Duration::from_millis(10))).unwrap();
        }
    }

    #[test]
    fn accept_completes_when_peer_connects() {
        let proactor = Proactor::new("test");

        let listener = syscall::create(Transport::TcpIpv4Stream).unwrap();
        syscall::bind(&listener, &Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0), true).unwrap();
        syscall::listen(&listener, 8).unwrap();
        let target = syscall::local_endpoint(&listener).unwrap();

        let (session, channels) = recording_session();
        let entry = proactor
            .attach_socket(listener.as_raw_fd(), session)
            .unwrap();
        proactor.submit(&entry, Submission::Accept).unwrap();

        // Nothing completes while the backlog is empty.
        proactor.drive(Some(Duration::from_millis(10))).unwrap();
        assert!(channels.accepted.is_empty());

        let _peer = std::net::TcpStream::connect(target.to_socket_addr().unwrap()).unwrap();
        drive_until(&proactor, || !channels.accepted.is_empty());

        let (child, endpoint) = channels.accepted.recv().unwrap().unwrap();
        assert!(endpoint.is_some());
        drop(child);

        proactor.detach(&entry).unwrap();
        assert_eq!(proactor.num_sockets(), 0);
    }

    #[test]
    fn connect_send_receive_round_trip() {
        let proactor = Proactor::new("test");

        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let target = Endpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();

        let client = syscall::create(Transport::TcpIpv4Stream).unwrap();
        let (session, channels) = recording_session();
        let entry = proactor.attach_socket(client.as_raw_fd(), session).unwrap();

        proactor
            .submit(&entry, Submission::Connect { endpoint: target })
            .unwrap();
        drive_until(&proactor, || !channels.connected.is_empty());
        channels.connected.recv().unwrap().unwrap();

        let (mut peer, _) = listener.accept().unwrap();

        // A queued receive completes once the peer writes.
        proactor
            .submit(
                &entry,
                Submission::Receive {
                    buffer: vec![0u8; 32],
                },
            )
            .unwrap();
        peer.write_all(b"COMPLETION").unwrap();
        drive_until(&proactor, || !channels.received.is_empty());
        let data = channels.received.recv().unwrap().unwrap();
        assert_eq!(data.as_slice(), b"COMPLETION");

        // A send completes with the bytes transferred.
        proactor
            .submit(
                &entry,
                Submission::Send {
                    data: Bytes::from_static(b"REPLY"),
                },
            )
            .unwrap();
        drive_until(&proactor, || !channels.sent.is_empty());
        assert_eq!(channels.sent.recv().unwrap().unwrap(), 5);

        let mut echo = [0u8; 5];
        peer.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"REPLY");

        proactor.detach(&entry).unwrap();
    }

    #[test]
    fn detach_discards_queued_submissions() {
        let proactor = Proactor::new("test");

        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let target = Endpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();

        let client = syscall::create(Transport::TcpIpv4Stream).unwrap();
        let (session, channels) = recording_session();
        let entry = proactor.attach_socket(client.as_raw_fd(), session).unwrap();

        proactor
            .submit(&entry, Submission::Connect { endpoint: target })
            .unwrap();
        drive_until(&proactor, || !channels.connected.is_empty());
        channels.connected.recv().unwrap().unwrap();

        // A receive that would wait forever dies with the detachment.
        proactor
            .submit(
                &entry,
                Submission::Receive {
                    buffer: vec![0u8; 16],
                },
            )
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        entry.set_detach_callback(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        proactor.detach(&entry).unwrap();
        drive_until(&proactor, || fired.load(Ordering::SeqCst) > 0);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(channels.received.is_empty());
        assert!(proactor.submit(&entry, Submission::Accept).is_err());
    }

    #[test]
    fn executor_jobs_run_on_drive() {
        let proactor = Proactor::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&ran);
        proactor.execute(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        drive_until(&proactor, || ran.load(Ordering::SeqCst) > 0);
    }
}
