//! User-visible socket events.
//!
//! Every asynchronous operation produces exactly one terminal event
//! (`Complete` or `Error`) on its callback. Advisory queue, shutdown, and
//! error announcements flow through a socket's monitor channel instead and
//! are never terminal.

use std::time::{Duration, SystemTime};

use crate::buffer::Blob;
use crate::endpoint::Endpoint;
use crate::error::Error;

/// Whether an operation finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The operation completed.
    Complete,
    /// The operation failed; the context carries the error.
    Error,
}

/// The outcome details of a connect operation.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    /// The endpoint the connection was established to or attempted against.
    pub endpoint: Option<Endpoint>,
    /// The name submitted for resolution, if the target was a name.
    pub name: Option<String>,
    /// Attempts left when the operation terminated.
    pub attempts_remaining: u32,
    /// Time from submission to establishment.
    pub latency: Option<Duration>,
    /// The terminal error, when the operation failed.
    pub error: Option<Error>,
}

/// The terminal event of a connect operation.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    /// Completion or failure.
    pub event_type: EventType,
    /// Outcome details.
    pub context: ConnectContext,
}

/// The outcome details of an accept operation.
#[derive(Debug, Clone, Default)]
pub struct AcceptContext {
    /// The remote endpoint of the accepted connection.
    pub endpoint: Option<Endpoint>,
    /// The terminal error, when the operation failed.
    pub error: Option<Error>,
}

/// The terminal event of an accept operation.
#[derive(Debug, Clone)]
pub struct AcceptEvent {
    /// Completion or failure.
    pub event_type: EventType,
    /// Outcome details.
    pub context: AcceptContext,
}

/// The outcome details of a send operation.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    /// Bytes moved into the transport by this operation.
    pub bytes_sent: usize,
    /// True if completion was deferred until the kernel acknowledged the
    /// borrowed pages.
    pub zero_copy: bool,
    /// The terminal error, when the operation failed.
    pub error: Option<Error>,
}

/// The terminal event of a send operation.
#[derive(Debug, Clone)]
pub struct SendEvent {
    /// Completion or failure.
    pub event_type: EventType,
    /// Outcome details.
    pub context: SendContext,
}

/// The outcome details of a receive operation.
#[derive(Debug, Clone, Default)]
pub struct ReceiveContext {
    /// The local endpoint the data arrived on.
    pub endpoint: Option<Endpoint>,
    /// The sender's endpoint, for message-oriented transports.
    pub foreign_endpoint: Option<Endpoint>,
    /// True if a datagram was longer than the buffer and was cut short.
    pub truncated: bool,
    /// The kernel receive timestamp, when timestamping is enabled.
    pub timestamp: Option<SystemTime>,
    /// The terminal error, when the operation failed.
    pub error: Option<Error>,
}

/// The terminal event of a receive operation.
#[derive(Debug, Clone)]
pub struct ReceiveEvent {
    /// Completion or failure.
    pub event_type: EventType,
    /// Outcome details.
    pub context: ReceiveContext,
    /// The received bytes, on completion.
    pub data: Option<Blob>,
}

/// The outcome details of an encryption upgrade.
#[derive(Debug, Clone, Default)]
pub struct UpgradeContext {
    /// The peer certificate in DER form, when the driver surfaced one.
    pub peer_certificate: Option<Vec<u8>>,
    /// The terminal error, when the handshake failed.
    pub error: Option<Error>,
}

/// The terminal event of an encryption upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeEvent {
    /// Completion or failure.
    pub event_type: EventType,
    /// Outcome details.
    pub context: UpgradeContext,
}

/// An advisory announcement about one of a socket's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventType {
    /// The queue shrank to its low watermark.
    LowWatermark,
    /// The queue grew to its high watermark.
    HighWatermark,
    /// Queued entries were discarded at teardown.
    Discarded,
    /// Flow control resumed the queue's direction.
    FlowControlRelaxed,
    /// Flow control suppressed the queue's direction.
    FlowControlApplied,
    /// A rate limiter paused the queue's direction.
    RateLimitApplied,
    /// A rate limiter resumed the queue's direction.
    RateLimitRelaxed,
}

/// The progress milestones of a socket shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEventType {
    /// The shutdown sequence began.
    Initiated,
    /// The send side is now shut down.
    Send,
    /// The receive side is now shut down.
    Receive,
    /// Both sides are down; the handle is closed.
    Complete,
}

/// Advisory events of a stream socket, delivered through its monitor.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A read queue announcement.
    ReadQueue(QueueEventType),
    /// A write queue announcement.
    WriteQueue(QueueEventType),
    /// A shutdown milestone.
    Shutdown(ShutdownEventType),
    /// A fatal transport error; `Shutdown(Complete)` follows.
    Error(Error),
}

/// Advisory events of a listener socket, delivered through its monitor.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// An accept queue announcement.
    AcceptQueue(QueueEventType),
    /// An accepted connection was closed because the connection limit was
    /// reached.
    ConnectionRejectedLimitReached,
    /// A shutdown milestone.
    Shutdown(ShutdownEventType),
    /// A fatal transport error; `Shutdown(Complete)` follows.
    Error(Error),
}

/// Advisory events of a datagram socket, delivered through its monitor.
#[derive(Debug, Clone)]
pub enum DatagramEvent {
    /// A read queue announcement.
    ReadQueue(QueueEventType),
    /// A write queue announcement.
    WriteQueue(QueueEventType),
    /// A shutdown milestone.
    Shutdown(ShutdownEventType),
    /// A fatal transport error; `Shutdown(Complete)` follows.
    Error(Error),
}

/// The terminal callback of a connect operation.
pub type ConnectCallback = Box<dyn FnOnce(ConnectEvent) + Send>;

/// The terminal callback of a send operation.
pub type SendCallback = Box<dyn FnOnce(SendEvent) + Send>;

/// The terminal callback of a receive operation.
pub type ReceiveCallback = Box<dyn FnOnce(ReceiveEvent) + Send>;

/// The terminal callback of an encryption upgrade.
pub type UpgradeCallback = Box<dyn FnOnce(UpgradeEvent) + Send>;

/// The hook receiving correlated transmit-timestamp latency samples.
pub type TimestampHook = std::sync::Arc<dyn Fn(TimestampSample) + Send + Sync>;

/// A latency sample correlated from a kernel transmit timestamp.
#[derive(Debug, Clone, Copy)]
pub struct TimestampSample {
    /// The send id the sample belongs to.
    pub id: u32,
    /// Which milestone the kernel reported.
    pub timestamp_type: crate::syscall::TimestampType,
    /// Time from user-level enqueue to the kernel milestone.
    pub latency: Duration,
}

impl ConnectEvent {
    /// A completion event for `endpoint`.
    #[must_use]
    pub fn complete(endpoint: Endpoint, latency: Duration, attempts_remaining: u32) -> Self {
        Self {
            event_type: EventType::Complete,
            context: ConnectContext {
                endpoint: Some(endpoint),
                name: None,
                attempts_remaining,
                latency: Some(latency),
                error: None,
            },
        }
    }

    /// A failure event carrying `error`.
    #[must_use]
    pub fn error(error: Error, endpoint: Option<Endpoint>) -> Self {
        Self {
            event_type: EventType::Error,
            context: ConnectContext {
                endpoint,
                name: None,
                attempts_remaining: 0,
                latency: None,
                error: Some(error),
            },
        }
    }
}

impl SendEvent {
    /// A completion event for `bytes_sent` bytes.
    #[must_use]
    pub fn complete(bytes_sent: usize, zero_copy: bool) -> Self {
        Self {
            event_type: EventType::Complete,
            context: SendContext {
                bytes_sent,
                zero_copy,
                error: None,
            },
        }
    }

    /// A failure event carrying `error`.
    #[must_use]
    pub fn error(error: Error) -> Self {
        Self {
            event_type: EventType::Error,
            context: SendContext {
                bytes_sent: 0,
                zero_copy: false,
                error: Some(error),
            },
        }
    }
}

impl ReceiveEvent {
    /// A completion event delivering `data`.
    #[must_use]
    pub fn complete(data: Blob, context: ReceiveContext) -> Self {
        Self {
            event_type: EventType::Complete,
            context,
            data: Some(data),
        }
    }

    /// A failure event carrying `error`.
    #[must_use]
    pub fn error(error: Error) -> Self {
        Self {
            event_type: EventType::Error,
            context: ReceiveContext {
                error: Some(error),
                ..ReceiveContext::default()
            },
            data: None,
        }
    }
}
