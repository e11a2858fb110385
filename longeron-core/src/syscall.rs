//! The syscall facade: blocking and non-blocking BSD-style socket
//! primitives behind one narrow surface.
//!
//! Every handle created here is non-blocking; operations that cannot make
//! progress return `WouldBlock` (or `Pending` for a connect in flight) and
//! are retried by the socket layer when the demultiplexer signals
//! readiness. Linux-only capabilities (zero-copy, transmit timestamps,
//! peer credentials) degrade to `NotImplemented` elsewhere.

#![allow(unsafe_code)]

use std::io::{IoSlice, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::option::SocketOption;

/// The transports a socket can be opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// TCP over IPv4.
    TcpIpv4Stream,
    /// TCP over IPv6.
    TcpIpv6Stream,
    /// UDP over IPv4.
    UdpIpv4Datagram,
    /// UDP over IPv6.
    UdpIpv6Datagram,
    /// A connection-oriented local (Unix domain) socket.
    #[cfg(unix)]
    LocalStream,
    /// A message-oriented local (Unix domain) socket.
    #[cfg(unix)]
    LocalDatagram,
}

impl Transport {
    /// True for connection-oriented transports.
    #[must_use]
    pub fn is_stream(self) -> bool {
        #[cfg(unix)]
        {
            matches!(
                self,
                Self::TcpIpv4Stream | Self::TcpIpv6Stream | Self::LocalStream
            )
        }
        #[cfg(not(unix))]
        {
            matches!(self, Self::TcpIpv4Stream | Self::TcpIpv6Stream)
        }
    }

    /// True for message-oriented transports.
    #[must_use]
    pub fn is_datagram(self) -> bool {
        !self.is_stream()
    }

    /// True for local (Unix domain) transports.
    #[must_use]
    pub fn is_local(self) -> bool {
        #[cfg(unix)]
        {
            matches!(self, Self::LocalStream | Self::LocalDatagram)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// The transport matching `endpoint` for the given mode.
    #[must_use]
    pub fn for_endpoint(endpoint: &Endpoint, stream: bool) -> Self {
        match endpoint {
            Endpoint::Ip(SocketAddr::V4(_)) => {
                if stream {
                    Self::TcpIpv4Stream
                } else {
                    Self::UdpIpv4Datagram
                }
            }
            Endpoint::Ip(SocketAddr::V6(_)) => {
                if stream {
                    Self::TcpIpv6Stream
                } else {
                    Self::UdpIpv6Datagram
                }
            }
            #[cfg(unix)]
            Endpoint::Local(_) => {
                if stream {
                    Self::LocalStream
                } else {
                    Self::LocalDatagram
                }
            }
        }
    }

    fn domain(self) -> Domain {
        match self {
            Self::TcpIpv4Stream | Self::UdpIpv4Datagram => Domain::IPV4,
            Self::TcpIpv6Stream | Self::UdpIpv6Datagram => Domain::IPV6,
            #[cfg(unix)]
            Self::LocalStream | Self::LocalDatagram => Domain::UNIX,
        }
    }

    fn socket_type(self) -> Type {
        if self.is_stream() {
            Type::STREAM
        } else {
            Type::DGRAM
        }
    }

    fn protocol(self) -> Option<Protocol> {
        match self {
            Self::TcpIpv4Stream | Self::TcpIpv6Stream => Some(Protocol::TCP),
            Self::UdpIpv4Datagram | Self::UdpIpv6Datagram => Some(Protocol::UDP),
            #[cfg(unix)]
            Self::LocalStream | Self::LocalDatagram => None,
        }
    }
}

fn to_sock_addr(endpoint: &Endpoint) -> Result<SockAddr> {
    match endpoint {
        Endpoint::Ip(addr) => Ok(SockAddr::from(*addr)),
        #[cfg(unix)]
        Endpoint::Local(path) => SockAddr::unix(path).map_err(Error::from),
    }
}

fn from_sock_addr(addr: &SockAddr) -> Option<Endpoint> {
    if let Some(socket_addr) = addr.as_socket() {
        return Some(Endpoint::Ip(socket_addr));
    }
    #[cfg(unix)]
    if let Some(path) = addr.as_pathname() {
        return Some(Endpoint::Local(path.to_path_buf()));
    }
    None
}

/// Run `operation` against a borrowed, non-owning view of `handle`.
///
/// The view never closes the descriptor; ownership stays with the caller.
#[cfg(unix)]
pub fn with_borrowed<T>(
    handle: std::os::unix::io::RawFd,
    operation: impl FnOnce(&Socket) -> T,
) -> T {
    use std::os::unix::io::FromRawFd;

    let socket = std::mem::ManuallyDrop::new(unsafe { Socket::from_raw_fd(handle) });
    operation(&socket)
}

/// Create a non-blocking socket for `transport`.
pub fn create(transport: Transport) -> Result<Socket> {
    let socket = Socket::new(
        transport.domain(),
        transport.socket_type(),
        transport.protocol(),
    )
    .map_err(Error::from)?;
    socket.set_nonblocking(true).map_err(Error::from)?;
    Ok(socket)
}

/// Bind `socket` to `endpoint`, optionally permitting address reuse.
pub fn bind(socket: &Socket, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
    if reuse_address {
        socket.set_reuse_address(true).map_err(Error::from)?;
    }
    socket.bind(&to_sock_addr(endpoint)?).map_err(Error::from)
}

/// Initiate a connection to `endpoint`. Returns `Pending` when the connect
/// continues in the background; completion is signaled by writability.
pub fn connect(socket: &Socket, endpoint: &Endpoint) -> Result<()> {
    match socket.connect(&to_sock_addr(endpoint)?) {
        Ok(()) => Ok(()),
        Err(error) => {
            #[cfg(unix)]
            if error.raw_os_error() == Some(libc::EINPROGRESS) {
                return Err(Error::new(ErrorKind::Pending));
            }
            if error.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::new(ErrorKind::Pending));
            }
            Err(Error::from(error))
        }
    }
}

/// Begin listening with the specified `backlog`.
pub fn listen(socket: &Socket, backlog: u32) -> Result<()> {
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(Error::from)
}

/// Accept one pending connection. The returned handle is non-blocking.
pub fn accept(socket: &Socket) -> Result<(Socket, Option<Endpoint>)> {
    let (child, addr) = socket.accept().map_err(Error::from)?;
    child.set_nonblocking(true).map_err(Error::from)?;
    Ok((child, from_sock_addr(&addr)))
}

/// The connect error latched on the handle, if any, consuming it.
pub fn take_error(socket: &Socket) -> Result<Option<Error>> {
    let latched = socket.take_error().map_err(Error::from)?;
    Ok(latched.map(Error::from))
}

/// The endpoint the handle is bound to.
pub fn local_endpoint(socket: &Socket) -> Result<Endpoint> {
    let addr = socket.local_addr().map_err(Error::from)?;
    from_sock_addr(&addr).ok_or(Error::new(ErrorKind::Invalid))
}

/// The endpoint of the connected peer.
pub fn peer_endpoint(socket: &Socket) -> Result<Endpoint> {
    let addr = socket.peer_addr().map_err(Error::from)?;
    from_sock_addr(&addr).ok_or(Error::new(ErrorKind::Invalid))
}

/// Gathered non-blocking send. When `zero_copy` is set on a supporting
/// platform the kernel borrows the pages and acknowledges them through the
/// error queue later.
pub fn send_vectored(socket: &Socket, buffers: &[IoSlice<'_>], zero_copy: bool) -> Result<usize> {
    #[cfg(target_os = "linux")]
    if zero_copy {
        use std::os::unix::io::AsRawFd;

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = buffers.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = buffers.len() as _;
        let sent = unsafe {
            libc::sendmsg(
                socket.as_raw_fd(),
                &msg,
                libc::MSG_ZEROCOPY | libc::MSG_NOSIGNAL,
            )
        };
        if sent < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        return Ok(sent as usize);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = zero_copy;

    (&mut &*socket).write_vectored(buffers).map_err(Error::from)
}

/// Non-blocking receive into `buffer`. A return of zero on a stream socket
/// means the peer shut down its sending side.
pub fn receive(socket: &Socket, buffer: &mut [u8]) -> Result<usize> {
    (&mut &*socket).read(buffer).map_err(Error::from)
}

/// One received datagram together with its delivery metadata.
#[derive(Debug, Clone, Default)]
pub struct ReceiveMeta {
    /// The sender's endpoint, when the transport reports one.
    pub endpoint: Option<Endpoint>,
    /// True if the datagram was longer than the buffer and was cut short.
    pub truncated: bool,
    /// The kernel receive timestamp, when timestamping is enabled.
    pub timestamp: Option<SystemTime>,
}

/// Non-blocking single-datagram receive with metadata.
#[cfg(unix)]
pub fn receive_message(socket: &Socket, buffer: &mut [u8]) -> Result<(usize, ReceiveMeta)> {
    use std::os::unix::io::AsRawFd;

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut control = [0u8; 128];
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(storage).cast();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }

    let mut meta = ReceiveMeta {
        endpoint: parse_sockaddr(&storage, msg.msg_namelen),
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        timestamp: None,
    };

    #[cfg(target_os = "linux")]
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_TIMESTAMPNS
            {
                let ts: libc::timespec = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast());
                meta.timestamp = Some(
                    SystemTime::UNIX_EPOCH
                        + Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32),
                );
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((received as usize, meta))
}

#[cfg(unix)]
fn parse_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<Endpoint> {
    if len == 0 {
        return None;
    }
    let addr = unsafe {
        SockAddr::new(
            *storage,
            len.min(std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t),
        )
    };
    from_sock_addr(&addr)
}

/// Non-blocking single-datagram send, optionally addressed to `endpoint`.
pub fn send_to(
    socket: &Socket,
    buffer: &[u8],
    endpoint: Option<&Endpoint>,
    zero_copy: bool,
) -> Result<usize> {
    match endpoint {
        Some(endpoint) => {
            let _ = zero_copy;
            socket
                .send_to(buffer, &to_sock_addr(endpoint)?)
                .map_err(Error::from)
        }
        None => send_vectored(socket, &[IoSlice::new(buffer)], zero_copy),
    }
}

/// Shut down one or both directions of the connection.
pub fn shutdown(socket: &Socket, how: std::net::Shutdown) -> Result<()> {
    match socket.shutdown(how) {
        Ok(()) => Ok(()),
        // The peer may already have torn the connection down.
        Err(error) if error.kind() == std::io::ErrorKind::NotConnected => Ok(()),
        Err(error) => Err(Error::from(error)),
    }
}

/// Apply a typed option to the handle.
pub fn set_option(socket: &Socket, option: &SocketOption) -> Result<()> {
    match option {
        SocketOption::ReuseAddress(enabled) => {
            socket.set_reuse_address(*enabled).map_err(Error::from)
        }
        SocketOption::KeepAlive(enabled) => socket.set_keepalive(*enabled).map_err(Error::from),
        SocketOption::DelayTransmission(enabled) => {
            socket.set_nodelay(!*enabled).map_err(Error::from)
        }
        SocketOption::SendBufferSize(size) => {
            socket.set_send_buffer_size(*size).map_err(Error::from)
        }
        SocketOption::ReceiveBufferSize(size) => {
            socket.set_recv_buffer_size(*size).map_err(Error::from)
        }
        SocketOption::Linger(linger) => socket.set_linger(*linger).map_err(Error::from),
        SocketOption::Broadcast(enabled) => socket.set_broadcast(*enabled).map_err(Error::from),
        SocketOption::Cork(enabled) => {
            #[cfg(target_os = "linux")]
            {
                set_raw_int(
                    socket,
                    libc::IPPROTO_TCP,
                    libc::TCP_CORK,
                    i32::from(*enabled),
                )
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = enabled;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::DelayAcknowledgement(enabled) => {
            #[cfg(target_os = "linux")]
            {
                set_raw_int(
                    socket,
                    libc::IPPROTO_TCP,
                    libc::TCP_QUICKACK,
                    i32::from(!*enabled),
                )
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = enabled;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::TcpCongestionControl(name) => {
            #[cfg(target_os = "linux")]
            {
                set_raw_bytes(
                    socket,
                    libc::IPPROTO_TCP,
                    libc::TCP_CONGESTION,
                    name.as_bytes(),
                )
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = name;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::SendBufferLowWatermark(size) => {
            #[cfg(unix)]
            {
                set_raw_int(socket, libc::SOL_SOCKET, libc::SO_SNDLOWAT, *size as i32)
            }
            #[cfg(not(unix))]
            {
                let _ = size;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::ReceiveBufferLowWatermark(size) => {
            #[cfg(unix)]
            {
                set_raw_int(socket, libc::SOL_SOCKET, libc::SO_RCVLOWAT, *size as i32)
            }
            #[cfg(not(unix))]
            {
                let _ = size;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::Debug(enabled) => {
            #[cfg(unix)]
            {
                set_raw_int(socket, libc::SOL_SOCKET, libc::SO_DEBUG, i32::from(*enabled))
            }
            #[cfg(not(unix))]
            {
                let _ = enabled;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::BypassRouting(enabled) => {
            #[cfg(unix)]
            {
                set_raw_int(
                    socket,
                    libc::SOL_SOCKET,
                    libc::SO_DONTROUTE,
                    i32::from(*enabled),
                )
            }
            #[cfg(not(unix))]
            {
                let _ = enabled;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::InlineOutOfBandData(enabled) => {
            #[cfg(unix)]
            {
                set_raw_int(
                    socket,
                    libc::SOL_SOCKET,
                    libc::SO_OOBINLINE,
                    i32::from(*enabled),
                )
            }
            #[cfg(not(unix))]
            {
                let _ = enabled;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::RxTimestamping(enabled) => {
            #[cfg(target_os = "linux")]
            {
                set_raw_int(
                    socket,
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMPNS,
                    i32::from(*enabled),
                )
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = enabled;
                Err(Error::new(ErrorKind::NotImplemented))
            }
        }
        SocketOption::TxTimestamping(enabled) => set_tx_timestamping(socket, *enabled),
        SocketOption::ZeroCopy(enabled) => set_zero_copy(socket, *enabled),
    }
}

/// Read back a typed option from the handle, where the platform supports
/// the query.
pub fn get_option(socket: &Socket, option: &SocketOption) -> Result<SocketOption> {
    match option {
        SocketOption::ReuseAddress(_) => Ok(SocketOption::ReuseAddress(
            socket.reuse_address().map_err(Error::from)?,
        )),
        SocketOption::KeepAlive(_) => Ok(SocketOption::KeepAlive(
            socket.keepalive().map_err(Error::from)?,
        )),
        SocketOption::DelayTransmission(_) => Ok(SocketOption::DelayTransmission(
            !socket.nodelay().map_err(Error::from)?,
        )),
        SocketOption::SendBufferSize(_) => Ok(SocketOption::SendBufferSize(
            socket.send_buffer_size().map_err(Error::from)?,
        )),
        SocketOption::ReceiveBufferSize(_) => Ok(SocketOption::ReceiveBufferSize(
            socket.recv_buffer_size().map_err(Error::from)?,
        )),
        SocketOption::Linger(_) => Ok(SocketOption::Linger(
            socket.linger().map_err(Error::from)?,
        )),
        SocketOption::Broadcast(_) => Ok(SocketOption::Broadcast(
            socket.broadcast().map_err(Error::from)?,
        )),
        _ => Err(Error::new(ErrorKind::NotImplemented)),
    }
}

#[cfg(unix)]
fn set_raw_int(socket: &Socket, level: i32, name: i32, value: i32) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_raw_bytes(socket: &Socket, level: i32, name: i32, value: &[u8]) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            value.as_ptr().cast(),
            value.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
}

// Flag bits of SO_TIMESTAMPING, from the Linux UAPI.
#[cfg(target_os = "linux")]
mod timestamping {
    pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
    pub const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
    pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
    pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
    pub const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
    pub const SOF_TIMESTAMPING_TX_SCHED: u32 = 1 << 8;
    pub const SOF_TIMESTAMPING_TX_ACK: u32 = 1 << 9;
    pub const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;
}

/// Enable or disable transmit timestamping on the handle.
pub fn set_tx_timestamping(socket: &Socket, enabled: bool) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use timestamping::*;

        let flags = if enabled {
            SOF_TIMESTAMPING_TX_SOFTWARE
                | SOF_TIMESTAMPING_TX_SCHED
                | SOF_TIMESTAMPING_TX_ACK
                | SOF_TIMESTAMPING_TX_HARDWARE
                | SOF_TIMESTAMPING_SOFTWARE
                | SOF_TIMESTAMPING_RAW_HARDWARE
                | SOF_TIMESTAMPING_OPT_ID
                | SOF_TIMESTAMPING_OPT_TSONLY
        } else {
            0
        };
        set_raw_int(socket, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags as i32)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, enabled);
        Err(Error::new(ErrorKind::NotImplemented))
    }
}

/// Enable or disable zero-copy transmission on the handle.
pub fn set_zero_copy(socket: &Socket, enabled: bool) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        set_raw_int(
            socket,
            libc::SOL_SOCKET,
            libc::SO_ZEROCOPY,
            i32::from(enabled),
        )
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, enabled);
        Err(Error::new(ErrorKind::NotImplemented))
    }
}

/// The credentials of the peer of a connected local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// The peer's process id.
    pub pid: i32,
    /// The peer's effective user id.
    pub uid: u32,
    /// The peer's effective group id.
    pub gid: u32,
}

/// Retrieve the peer credentials of a connected local socket.
pub fn peer_credentials(socket: &Socket) -> Result<PeerCredentials> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let mut credentials: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(credentials).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(PeerCredentials {
            pid: credentials.pid,
            uid: credentials.uid,
            gid: credentials.gid,
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
        Err(Error::new(ErrorKind::NotImplemented))
    }
}

/// Join the multicast `group` on `interface`.
pub fn join_multicast_group(
    socket: &Socket,
    interface: std::net::IpAddr,
    group: std::net::IpAddr,
) -> Result<()> {
    match (group, interface) {
        (std::net::IpAddr::V4(group), std::net::IpAddr::V4(interface)) => socket
            .join_multicast_v4(&group, &interface)
            .map_err(Error::from),
        (std::net::IpAddr::V6(group), std::net::IpAddr::V6(_)) => socket
            .join_multicast_v6(&group, 0)
            .map_err(Error::from),
        _ => Err(Error::new(ErrorKind::Invalid)),
    }
}

/// Leave the multicast `group` on `interface`.
pub fn leave_multicast_group(
    socket: &Socket,
    interface: std::net::IpAddr,
    group: std::net::IpAddr,
) -> Result<()> {
    match (group, interface) {
        (std::net::IpAddr::V4(group), std::net::IpAddr::V4(interface)) => socket
            .leave_multicast_v4(&group, &interface)
            .map_err(Error::from),
        (std::net::IpAddr::V6(group), std::net::IpAddr::V6(_)) => socket
            .leave_multicast_v6(&group, 0)
            .map_err(Error::from),
        _ => Err(Error::new(ErrorKind::Invalid)),
    }
}

/// Set the time-to-live of outgoing multicast datagrams.
pub fn set_multicast_ttl(socket: &Socket, ipv6: bool, ttl: u32) -> Result<()> {
    if ipv6 {
        socket.set_multicast_hops_v6(ttl).map_err(Error::from)
    } else {
        socket.set_multicast_ttl_v4(ttl).map_err(Error::from)
    }
}

/// Control delivery of locally-sent multicast datagrams back to this host.
pub fn set_multicast_loopback(socket: &Socket, ipv6: bool, enabled: bool) -> Result<()> {
    if ipv6 {
        socket.set_multicast_loop_v6(enabled).map_err(Error::from)
    } else {
        socket.set_multicast_loop_v4(enabled).map_err(Error::from)
    }
}

/// Select the interface used for outgoing multicast datagrams.
pub fn set_multicast_interface(socket: &Socket, interface: std::net::IpAddr) -> Result<()> {
    match interface {
        std::net::IpAddr::V4(interface) => socket
            .set_multicast_if_v4(&interface)
            .map_err(Error::from),
        std::net::IpAddr::V6(_) => Err(Error::new(ErrorKind::NotImplemented)),
    }
}

/// The kind of transmit timestamp a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampType {
    /// The payload left the host (software).
    Sent,
    /// The payload entered the packet scheduler.
    Scheduled,
    /// The peer acknowledged the payload.
    Acknowledged,
}

/// One notification drained from the handle's error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorQueueNotification {
    /// The kernel finished borrowing the pages of the sends in the id
    /// range `[from, to]`, inclusive, possibly wrapping.
    ZeroCopy {
        /// First acknowledged send id.
        from: u32,
        /// Last acknowledged send id.
        to: u32,
        /// True if the kernel fell back to copying.
        copied: bool,
    },
    /// A transmit timestamp for the send with the given id.
    Timestamp {
        /// The id assigned by `SOF_TIMESTAMPING_OPT_ID` counting.
        id: u32,
        /// Which milestone the timestamp records.
        timestamp_type: TimestampType,
        /// The kernel clock reading.
        time: SystemTime,
    },
}

// Error-queue origin and timestamp kinds, from the Linux UAPI.
#[cfg(target_os = "linux")]
const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
#[cfg(target_os = "linux")]
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
#[cfg(target_os = "linux")]
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;
#[cfg(target_os = "linux")]
const SCM_TSTAMP_SND: u32 = 0;
#[cfg(target_os = "linux")]
const SCM_TSTAMP_SCHED: u32 = 1;
#[cfg(target_os = "linux")]
const SCM_TSTAMP_ACK: u32 = 2;

/// Drain the handle's error queue of zero-copy acknowledgements and
/// transmit timestamps. Returns an empty list on platforms without an
/// error queue.
pub fn drain_error_queue(socket: &Socket) -> Result<Vec<ErrorQueueNotification>> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        let mut notifications = Vec::new();
        loop {
            let mut control = [0u8; 256];
            let mut data = [0u8; 64];
            let mut iov = libc::iovec {
                iov_base: data.as_mut_ptr().cast(),
                iov_len: data.len(),
            };

            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = control.len() as _;

            let received =
                unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_ERRQUEUE) };
            if received < 0 {
                let error = std::io::Error::last_os_error();
                if error.kind() == std::io::ErrorKind::WouldBlock {
                    break;
                }
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::from(error));
            }

            let mut pending_timestamp: Option<SystemTime> = None;
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let level = (*cmsg).cmsg_level;
                    let kind = (*cmsg).cmsg_type;

                    if level == libc::SOL_SOCKET && kind == libc::SCM_TIMESTAMPING {
                        // scm_timestamping carries three timespecs:
                        // software, deprecated, hardware.
                        let data_ptr = libc::CMSG_DATA(cmsg);
                        let software: libc::timespec = std::ptr::read_unaligned(data_ptr.cast());
                        let hardware: libc::timespec = std::ptr::read_unaligned(
                            data_ptr
                                .add(2 * std::mem::size_of::<libc::timespec>())
                                .cast(),
                        );
                        let chosen = if software.tv_sec != 0 || software.tv_nsec != 0 {
                            software
                        } else {
                            hardware
                        };
                        pending_timestamp = Some(
                            SystemTime::UNIX_EPOCH
                                + Duration::new(chosen.tv_sec as u64, chosen.tv_nsec as u32),
                        );
                    } else if (level == libc::SOL_IP && kind == libc::IP_RECVERR)
                        || (level == libc::SOL_IPV6 && kind == libc::IPV6_RECVERR)
                    {
                        let err: libc::sock_extended_err =
                            std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast());
                        match err.ee_origin {
                            SO_EE_ORIGIN_ZEROCOPY => {
                                notifications.push(ErrorQueueNotification::ZeroCopy {
                                    from: err.ee_info,
                                    to: err.ee_data,
                                    copied: err.ee_code == SO_EE_CODE_ZEROCOPY_COPIED,
                                });
                            }
                            SO_EE_ORIGIN_TIMESTAMPING => {
                                let timestamp_type = match err.ee_info {
                                    SCM_TSTAMP_SCHED => Some(TimestampType::Scheduled),
                                    SCM_TSTAMP_SND => Some(TimestampType::Sent),
                                    SCM_TSTAMP_ACK => Some(TimestampType::Acknowledged),
                                    _ => None,
                                };
                                if let (Some(timestamp_type), Some(time)) =
                                    (timestamp_type, pending_timestamp)
                                {
                                    notifications.push(ErrorQueueNotification::Timestamp {
                                        id: err.ee_data,
                                        timestamp_type,
                                        time,
                                    });
                                }
                            }
                            _ => {}
                        }
                    }

                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }
        Ok(notifications)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn transport_classification() {
        assert!(Transport::TcpIpv4Stream.is_stream());
        assert!(!Transport::TcpIpv4Stream.is_datagram());
        assert!(Transport::UdpIpv6Datagram.is_datagram());
        #[cfg(unix)]
        {
            assert!(Transport::LocalStream.is_local());
            assert!(!Transport::TcpIpv6Stream.is_local());
        }
    }

    #[test]
    fn transport_for_endpoint() {
        let v4 = Endpoint::ipv4(Ipv4Addr::LOCALHOST, 80);
        assert_eq!(Transport::for_endpoint(&v4, true), Transport::TcpIpv4Stream);
        assert_eq!(
            Transport::for_endpoint(&v4, false),
            Transport::UdpIpv4Datagram
        );
    }

    #[test]
    fn bind_and_query_local_endpoint() {
        let socket = create(Transport::TcpIpv4Stream).unwrap();
        let any = Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0);
        bind(&socket, &any, true).unwrap();
        let bound = local_endpoint(&socket).unwrap();
        assert!(bound.port().unwrap() > 0);
    }

    #[test]
    fn connect_in_progress_reports_pending() {
        let listener = create(Transport::TcpIpv4Stream).unwrap();
        bind(&listener, &Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0), true).unwrap();
        listen(&listener, 8).unwrap();
        let target = local_endpoint(&listener).unwrap();

        let client = create(Transport::TcpIpv4Stream).unwrap();
        match connect(&client, &target) {
            Ok(()) => {}
            Err(error) => assert_eq!(error.kind(), ErrorKind::Pending),
        }
    }

    #[test]
    fn accept_would_block_when_idle() {
        let listener = create(Transport::TcpIpv4Stream).unwrap();
        bind(&listener, &Endpoint::ipv4(Ipv4Addr::LOCALHOST, 0), true).unwrap();
        listen(&listener, 8).unwrap();

        let error = accept(&listener).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn options_round_trip() {
        let socket = create(Transport::TcpIpv4Stream).unwrap();
        set_option(&socket, &SocketOption::KeepAlive(true)).unwrap();
        match get_option(&socket, &SocketOption::KeepAlive(false)).unwrap() {
            SocketOption::KeepAlive(enabled) => assert!(enabled),
            other => panic!("unexpected option {other:?}"),
        }
    }
}
