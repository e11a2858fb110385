//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! An [`Endpoint`] names the source or destination of a transport: an IPv4
//! or IPv6 address and port, or a local (Unix domain) filesystem path.
//! Endpoints are immutable after construction, parseable from text, and
//! formatted bit-exactly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::str::FromStr;

/// Transport endpoint address.
///
/// Text formats:
/// - IPv4: `a.b.c.d:port`
/// - IPv6: `[addr]:port`, optionally with a zone id `[addr%zone]:port`
/// - Local: a filesystem path containing a path separator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// An IPv4 or IPv6 address and port.
    Ip(SocketAddr),
    /// A local (Unix domain) socket path.
    #[cfg(unix)]
    Local(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// # Examples
    ///
    /// ```
    /// use longeron_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("127.0.0.1:5555").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Ip(_)));
    ///
    /// let endpoint = Endpoint::parse("[::1]:5555").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Ip(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Construct an IPv4 endpoint.
    #[must_use]
    pub fn ipv4(address: Ipv4Addr, port: u16) -> Self {
        Self::Ip(SocketAddr::V4(SocketAddrV4::new(address, port)))
    }

    /// Construct an IPv6 endpoint with the specified `scope_id`.
    #[must_use]
    pub fn ipv6(address: Ipv6Addr, port: u16, scope_id: u32) -> Self {
        Self::Ip(SocketAddr::V6(SocketAddrV6::new(address, port, 0, scope_id)))
    }

    /// Construct a local endpoint from a filesystem path.
    #[cfg(unix)]
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    /// Returns true if this is an IP endpoint.
    #[must_use]
    pub fn is_ip(&self) -> bool {
        matches!(self, Self::Ip(_))
    }

    /// Returns true if this is a local endpoint.
    #[cfg(unix)]
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// The IP address and port, if this is an IP endpoint.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(addr) => Some(*addr),
            #[cfg(unix)]
            Self::Local(_) => None,
        }
    }

    /// The IP address, if this is an IP endpoint.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.to_socket_addr().map(|addr| addr.ip())
    }

    /// The port, if this is an IP endpoint.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.to_socket_addr().map(|addr| addr.port())
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }

        // "[addr%zone]:port" is not accepted by the std parser. Only
        // numeric zone ids are recognized.
        if let Some(rest) = s.strip_prefix('[') {
            if let Some((inner, port)) = rest.rsplit_once("]:") {
                if let Some((addr, zone)) = inner.rsplit_once('%') {
                    let address = addr
                        .parse::<Ipv6Addr>()
                        .map_err(|_| EndpointError::InvalidIpAddress(s.to_string()))?;
                    let scope_id = zone
                        .parse::<u32>()
                        .map_err(|_| EndpointError::InvalidZone(zone.to_string()))?;
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
                    return Ok(Self::ipv6(address, port, scope_id));
                }
                return Err(EndpointError::InvalidIpAddress(s.to_string()));
            }
        }

        #[cfg(unix)]
        if s.contains('/') {
            return Ok(Self::Local(PathBuf::from(s)));
        }

        Err(EndpointError::Unrecognized(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => write!(f, "{addr}"),
            Self::Ip(SocketAddr::V6(addr)) => {
                if addr.scope_id() == 0 {
                    write!(f, "[{}]:{}", addr.ip(), addr.port())
                } else {
                    write!(f, "[{}%{}]:{}", addr.ip(), addr.scope_id(), addr.port())
                }
            }
            #[cfg(unix)]
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<EndpointError> for crate::error::Error {
    fn from(_: EndpointError) -> Self {
        crate::error::Error::new(crate::error::ErrorKind::Invalid)
    }
}

/// Errors that can occur when parsing an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("empty endpoint")]
    Empty,

    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid zone id: {0}")]
    InvalidZone(String),

    #[error("unrecognized endpoint: {0}")]
    Unrecognized(String),
}

/// An Ethernet hardware address.
///
/// Formatted as six lowercase hex bytes separated by `:`, exactly
/// 17 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EthernetAddress([u8; 6]);

impl EthernetAddress {
    /// Construct from the raw six bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The raw six bytes.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for EthernetAddress {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 17 {
            return Err(EndpointError::Unrecognized(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (index, part) in s.split(':').enumerate() {
            if index >= 6 || part.len() != 2 {
                return Err(EndpointError::Unrecognized(s.to_string()));
            }
            bytes[index] = u8::from_str_radix(part, 16)
                .map_err(|_| EndpointError::Unrecognized(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4() {
        let endpoint = Endpoint::parse("127.0.0.1:5555").unwrap();
        assert_eq!(endpoint.port(), Some(5555));
        assert_eq!(endpoint.to_string(), "127.0.0.1:5555");
    }

    #[test]
    fn parses_ipv6() {
        let endpoint = Endpoint::parse("[::1]:5555").unwrap();
        assert_eq!(endpoint.to_string(), "[::1]:5555");
    }

    #[test]
    fn parses_ipv6_with_zone() {
        let endpoint = Endpoint::parse("[fe80::1%3]:80").unwrap();
        match endpoint {
            Endpoint::Ip(SocketAddr::V6(addr)) => assert_eq!(addr.scope_id(), 3),
            other => panic!("expected IPv6 endpoint, got {other:?}"),
        }
        assert_eq!(endpoint.to_string(), "[fe80::1%3]:80");
    }

    #[cfg(unix)]
    #[test]
    fn parses_local_path() {
        let endpoint = Endpoint::parse("/tmp/test.sock").unwrap();
        assert!(endpoint.is_local());
        assert_eq!(endpoint.to_string(), "/tmp/test.sock");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("not-an-endpoint").is_err());
        assert!(Endpoint::parse("[::1]:notaport").is_err());
    }

    #[test]
    fn ethernet_address_round_trip() {
        let address: EthernetAddress = "00:1a:2b:3c:4d:5e".parse().unwrap();
        assert_eq!(address.octets(), [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(address.to_string(), "00:1a:2b:3c:4d:5e");
        assert_eq!(address.to_string().len(), 17);
    }

    #[test]
    fn ethernet_address_rejects_malformed() {
        assert!("00:1a:2b:3c:4d".parse::<EthernetAddress>().is_err());
        assert!("00:1a:2b:3c:4d:zz".parse::<EthernetAddress>().is_err());
    }
}
