//! Socket configuration options.
//!
//! Plain-old-data option structs with `with_*` builders configure sockets at
//! open time, and per-operation option structs qualify individual connect,
//! accept, send, and receive submissions.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;

/// A typed socket option applied through the syscall facade.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketOption {
    /// Allow binding to an address in `TIME_WAIT`.
    ReuseAddress(bool),
    /// Periodically probe the peer to keep the connection alive.
    KeepAlive(bool),
    /// Cork small writes until uncorked or a full segment accumulates.
    Cork(bool),
    /// Delay transmission to coalesce small segments (Nagle's algorithm).
    DelayTransmission(bool),
    /// Delay acknowledgements to piggy-back them on data.
    DelayAcknowledgement(bool),
    /// The kernel send buffer size, in bytes.
    SendBufferSize(usize),
    /// The minimum kernel send buffer space before writability is signaled.
    SendBufferLowWatermark(usize),
    /// The kernel receive buffer size, in bytes.
    ReceiveBufferSize(usize),
    /// The minimum kernel receive buffer fill before readability is signaled.
    ReceiveBufferLowWatermark(usize),
    /// Enable socket-level debugging in the kernel.
    Debug(bool),
    /// Linger on close for up to the specified duration.
    Linger(Option<Duration>),
    /// Permit sending to broadcast addresses.
    Broadcast(bool),
    /// Bypass the routing table.
    BypassRouting(bool),
    /// Deliver out-of-band data inline.
    InlineOutOfBandData(bool),
    /// Record kernel receive timestamps.
    RxTimestamping(bool),
    /// Record kernel transmit timestamps.
    TxTimestamping(bool),
    /// Request zero-copy transmission.
    ZeroCopy(bool),
    /// Select the TCP congestion control algorithm by name.
    TcpCongestionControl(String),
}

/// Restriction of name resolution to one IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddressType {
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

/// Configuration of a dual-rate limiter: a sustained bucket and a peak
/// bucket, each defined by a rate and the time window it may burst over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Sustained rate, in units per second.
    pub sustained_rate_limit: u64,
    /// Window over which the sustained rate may burst.
    pub sustained_rate_window: Duration,
    /// Peak rate, in units per second.
    pub peak_rate_limit: u64,
    /// Window over which the peak rate may burst.
    pub peak_rate_window: Duration,
}

impl RateLimiterConfig {
    /// A limiter allowing `rate` units per second, bursting over one second.
    #[must_use]
    pub fn uniform(rate: u64) -> Self {
        Self {
            sustained_rate_limit: rate,
            sustained_rate_window: Duration::from_secs(1),
            peak_rate_limit: rate,
            peak_rate_window: Duration::from_secs(1),
        }
    }
}

/// Clamp a watermark pair so that `0 < high` and `low < high`.
pub(crate) fn sanitize_watermarks(low: &mut usize, high: &mut usize) {
    if *high == 0 {
        *high = 1;
    }
    if *low >= *high {
        *low = *high - 1;
    }
}

/// An opaque token identifying a pending operation for cancellation.
///
/// Tokens compare by identity; two tokens generated separately never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationToken(u64);

impl OperationToken {
    /// Generate a process-unique token.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Configuration of an asynchronous stream socket.
#[derive(Debug, Clone)]
pub struct StreamSocketOptions {
    /// Read queue size at which pending receives become eager again.
    pub read_queue_low_watermark: usize,
    /// Read queue size at which receive flow control is applied.
    pub read_queue_high_watermark: usize,
    /// Write queue size at which the low-watermark event is announced.
    pub write_queue_low_watermark: usize,
    /// Write queue size at which further sends are refused.
    pub write_queue_high_watermark: usize,
    /// Size of the scratch buffer used to drain the kernel receive buffer.
    pub read_buffer_size: usize,
    /// Segment size of the blobs backing the I/O queues.
    pub blob_segment_size: usize,
    /// Do not cascade a one-sided shutdown into the other direction.
    pub keep_half_open: bool,
    /// Limit the rate of outgoing bytes.
    pub send_rate_limiter: Option<RateLimiterConfig>,
    /// Limit the rate of incoming bytes.
    pub receive_rate_limiter: Option<RateLimiterConfig>,
    /// Request zero-copy transmission for sends at least this large.
    pub zero_copy_threshold: Option<usize>,
    /// Record kernel transmit timestamps and correlate them to sends.
    pub timestamp_outgoing_data: bool,
    /// Disable coalescing of small segments.
    pub no_delay: bool,
    /// Options applied verbatim to the handle after open.
    pub socket_options: Vec<SocketOption>,
}

impl Default for StreamSocketOptions {
    fn default() -> Self {
        Self {
            read_queue_low_watermark: 1,
            read_queue_high_watermark: 1024 * 1024,
            write_queue_low_watermark: 0,
            write_queue_high_watermark: 1024 * 1024,
            read_buffer_size: 32 * 1024,
            blob_segment_size: 8192,
            keep_half_open: false,
            send_rate_limiter: None,
            receive_rate_limiter: None,
            zero_copy_threshold: None,
            timestamp_outgoing_data: false,
            no_delay: true,
            socket_options: Vec::new(),
        }
    }
}

impl StreamSocketOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the write queue watermarks.
    #[must_use]
    pub fn with_write_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.write_queue_low_watermark = low;
        self.write_queue_high_watermark = high;
        sanitize_watermarks(
            &mut self.write_queue_low_watermark,
            &mut self.write_queue_high_watermark,
        );
        self
    }

    /// Set the read queue watermarks.
    #[must_use]
    pub fn with_read_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.read_queue_low_watermark = low;
        self.read_queue_high_watermark = high;
        sanitize_watermarks(
            &mut self.read_queue_low_watermark,
            &mut self.read_queue_high_watermark,
        );
        self
    }

    /// Keep the other direction open across a one-sided shutdown.
    #[must_use]
    pub fn with_keep_half_open(mut self, keep_half_open: bool) -> Self {
        self.keep_half_open = keep_half_open;
        self
    }

    /// Limit the rate of outgoing bytes.
    #[must_use]
    pub fn with_send_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.send_rate_limiter = Some(config);
        self
    }

    /// Limit the rate of incoming bytes.
    #[must_use]
    pub fn with_receive_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.receive_rate_limiter = Some(config);
        self
    }

    /// Request zero-copy transmission for sends at least `threshold` bytes.
    #[must_use]
    pub fn with_zero_copy_threshold(mut self, threshold: usize) -> Self {
        self.zero_copy_threshold = Some(threshold);
        self
    }

    /// Record kernel transmit timestamps and correlate them to sends.
    #[must_use]
    pub fn with_timestamp_outgoing_data(mut self, enabled: bool) -> Self {
        self.timestamp_outgoing_data = enabled;
        self
    }

    /// Apply a typed option verbatim to the handle after open.
    #[must_use]
    pub fn with_socket_option(mut self, option: SocketOption) -> Self {
        self.socket_options.push(option);
        self
    }
}

/// Configuration of an asynchronous listener socket.
#[derive(Debug, Clone)]
pub struct ListenerSocketOptions {
    /// The listen backlog.
    pub backlog: u32,
    /// Accept queue size at which pending accepts become eager again.
    pub accept_queue_low_watermark: usize,
    /// Accept queue size at which accept flow control is applied.
    pub accept_queue_high_watermark: usize,
    /// Limit the rate of accepted connections.
    pub accept_rate_limiter: Option<RateLimiterConfig>,
    /// Reject accepted connections beyond this count.
    pub max_connections: Option<usize>,
    /// Allow rebinding to an address in `TIME_WAIT`.
    pub reuse_address: bool,
    /// Template applied to accepted child sockets.
    pub child_options: StreamSocketOptions,
}

impl Default for ListenerSocketOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            accept_queue_low_watermark: 1,
            accept_queue_high_watermark: 1024,
            accept_rate_limiter: None,
            max_connections: None,
            reuse_address: true,
            child_options: StreamSocketOptions::default(),
        }
    }
}

impl ListenerSocketOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen backlog.
    #[must_use]
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the accept queue watermarks.
    #[must_use]
    pub fn with_accept_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.accept_queue_low_watermark = low;
        self.accept_queue_high_watermark = high;
        sanitize_watermarks(
            &mut self.accept_queue_low_watermark,
            &mut self.accept_queue_high_watermark,
        );
        self
    }

    /// Reject accepted connections beyond `limit`.
    #[must_use]
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = Some(limit);
        self
    }

    /// Limit the rate of accepted connections.
    #[must_use]
    pub fn with_accept_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.accept_rate_limiter = Some(config);
        self
    }

    /// Set the template applied to accepted child sockets.
    #[must_use]
    pub fn with_child_options(mut self, child_options: StreamSocketOptions) -> Self {
        self.child_options = child_options;
        self
    }
}

/// Configuration of an asynchronous datagram socket.
#[derive(Debug, Clone)]
pub struct DatagramSocketOptions {
    /// Maximum datagram payload accepted from the kernel.
    pub max_datagram_size: usize,
    /// Write queue size at which further sends are refused.
    pub write_queue_high_watermark: usize,
    /// Write queue size at which the low-watermark event is announced.
    pub write_queue_low_watermark: usize,
    /// Allow rebinding to an address in `TIME_WAIT`.
    pub reuse_address: bool,
    /// Time-to-live of outgoing multicast datagrams.
    pub multicast_ttl: Option<u32>,
    /// Deliver locally-sent multicast datagrams back to this host.
    pub multicast_loopback: Option<bool>,
    /// Interface used for outgoing multicast datagrams.
    pub multicast_interface: Option<IpAddr>,
    /// Record kernel receive timestamps on delivered datagrams.
    pub timestamp_incoming_data: bool,
    /// Options applied verbatim to the handle after open.
    pub socket_options: Vec<SocketOption>,
}

impl Default for DatagramSocketOptions {
    fn default() -> Self {
        Self {
            max_datagram_size: 64 * 1024,
            write_queue_high_watermark: 1024 * 1024,
            write_queue_low_watermark: 0,
            reuse_address: false,
            multicast_ttl: None,
            multicast_loopback: None,
            multicast_interface: None,
            timestamp_incoming_data: false,
            socket_options: Vec::new(),
        }
    }
}

impl DatagramSocketOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-to-live of outgoing multicast datagrams.
    #[must_use]
    pub fn with_multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = Some(ttl);
        self
    }

    /// Deliver locally-sent multicast datagrams back to this host.
    #[must_use]
    pub fn with_multicast_loopback(mut self, loopback: bool) -> Self {
        self.multicast_loopback = Some(loopback);
        self
    }

    /// Set the interface used for outgoing multicast datagrams.
    #[must_use]
    pub fn with_multicast_interface(mut self, interface: IpAddr) -> Self {
        self.multicast_interface = Some(interface);
        self
    }

    /// Record kernel receive timestamps on delivered datagrams.
    #[must_use]
    pub fn with_timestamp_incoming_data(mut self, enabled: bool) -> Self {
        self.timestamp_incoming_data = enabled;
        self
    }
}

/// Options qualifying a single connect submission.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Number of additional attempts after the first fails.
    pub retry_count: u32,
    /// Delay between attempts.
    pub retry_interval: Duration,
    /// Abandon the connect entirely at this time.
    pub deadline: Option<Instant>,
    /// Token matched by [`cancel`](crate::stream::StreamSocket::cancel).
    pub token: Option<OperationToken>,
    /// Address used when name resolution yields nothing.
    pub ip_address_fallback: Option<IpAddr>,
    /// Port used when the target names no port.
    pub port_fallback: Option<u16>,
    /// Restrict resolution to one address family.
    pub ip_address_type: Option<IpAddressType>,
}

impl ConnectOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry `count` additional times, waiting `interval` between attempts.
    #[must_use]
    pub fn with_retry(mut self, count: u32, interval: Duration) -> Self {
        self.retry_count = count;
        self.retry_interval = interval;
        self
    }

    /// Abandon the connect entirely at `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: OperationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Use `address` when name resolution yields nothing.
    #[must_use]
    pub fn with_ip_address_fallback(mut self, address: IpAddr) -> Self {
        self.ip_address_fallback = Some(address);
        self
    }

    /// Use `port` when the target names no port.
    #[must_use]
    pub fn with_port_fallback(mut self, port: u16) -> Self {
        self.port_fallback = Some(port);
        self
    }
}

/// Options qualifying a single accept submission.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Complete the accept with `Cancelled` at this time.
    pub deadline: Option<Instant>,
    /// Token matched by cancellation.
    pub token: Option<OperationToken>,
}

impl AcceptOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the accept with `Cancelled` at `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: OperationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// Options qualifying a single send submission.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Complete the send with `Cancelled` at this time if still queued.
    pub deadline: Option<Instant>,
    /// Token matched by cancellation.
    pub token: Option<OperationToken>,
    /// Enqueue even when the write queue high watermark would be breached.
    pub suppress_high_watermark: bool,
    /// Request zero-copy transmission regardless of the configured threshold.
    pub zero_copy: bool,
    /// Destination of the datagram, for unconnected datagram sockets.
    pub endpoint: Option<Endpoint>,
    /// Explicit source address, for multicast senders.
    pub source: Option<IpAddr>,
    /// Time-to-live override for this datagram.
    pub ttl: Option<u32>,
}

impl SendOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the send with `Cancelled` at `deadline` if still queued.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: OperationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Enqueue even when the write queue high watermark would be breached.
    #[must_use]
    pub fn with_suppress_high_watermark(mut self, suppress: bool) -> Self {
        self.suppress_high_watermark = suppress;
        self
    }

    /// Request zero-copy transmission.
    #[must_use]
    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    /// Address the datagram to `endpoint`.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// Options qualifying a single receive submission.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Complete only once at least this many bytes are available.
    pub min_size: usize,
    /// Deliver at most this many bytes.
    pub max_size: usize,
    /// Complete the receive with `Cancelled` at this time.
    pub deadline: Option<Instant>,
    /// Token matched by cancellation.
    pub token: Option<OperationToken>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: usize::MAX,
            deadline: None,
            token: None,
        }
    }
}

impl ReceiveOptions {
    /// Create the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete only once at least `min_size` bytes are available.
    #[must_use]
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size.max(1);
        self
    }

    /// Deliver at most `max_size` bytes.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Complete the receive with `Cancelled` at `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: OperationToken) -> Self {
        self.token = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_sanitized() {
        let options = StreamSocketOptions::new().with_write_queue_watermarks(10, 0);
        assert_eq!(options.write_queue_high_watermark, 1);
        assert!(options.write_queue_low_watermark < options.write_queue_high_watermark);

        let options = StreamSocketOptions::new().with_read_queue_watermarks(64, 64);
        assert_eq!(options.read_queue_low_watermark, 63);
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(OperationToken::generate(), OperationToken::generate());
    }

    #[test]
    fn receive_min_size_floor() {
        let options = ReceiveOptions::new().with_min_size(0);
        assert_eq!(options.min_size, 1);
    }

    #[test]
    fn builder_chains() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let options = ConnectOptions::new()
            .with_retry(2, Duration::from_millis(10))
            .with_deadline(deadline)
            .with_port_fallback(81);
        assert_eq!(options.retry_count, 2);
        assert_eq!(options.retry_interval, Duration::from_millis(10));
        assert_eq!(options.port_fallback, Some(81));
        assert_eq!(options.deadline, Some(deadline));
    }
}
