//! The resolver front end.
//!
//! Maps host and service names to endpoints and back. An override store is
//! consulted first when enabled, then a pluggable system backend. The
//! asynchronous variants run on a dedicated lookup thread and deliver
//! their callbacks through the caller's strand, honoring cancellation
//! tokens and deadlines.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::option::{IpAddressType, OperationToken};
use crate::strand::Strand;

/// Options qualifying a host-to-address lookup.
#[derive(Debug, Clone, Default)]
pub struct IpAddressOptions {
    /// Restrict results to one address family.
    pub ip_address_type: Option<IpAddressType>,
    /// Keep only these addresses, when non-empty.
    pub ip_address_filter: Vec<IpAddr>,
    /// Select the result at this index instead of the first.
    pub ip_address_selector: Option<usize>,
    /// Address used when resolution yields nothing.
    pub ip_address_fallback: Option<IpAddr>,
    /// Port used when the text names no port.
    pub port_fallback: Option<u16>,
    /// Fail the asynchronous variant with `DnsTimeout` past this time.
    pub deadline: Option<Instant>,
    /// Token matched by [`Resolver::cancel`].
    pub token: Option<OperationToken>,
}

/// Options qualifying a service-to-port lookup.
#[derive(Debug, Clone, Default)]
pub struct PortOptions {
    /// Keep only these ports, when non-empty.
    pub port_filter: Vec<u16>,
    /// Port used when resolution yields nothing.
    pub port_fallback: Option<u16>,
}

/// The system-dependent half of name resolution.
pub trait ResolverBackend: Send + Sync {
    /// All addresses `name` resolves to.
    fn resolve_host(&self, name: &str) -> Result<Vec<IpAddr>>;

    /// All ports `service` names.
    fn resolve_service(&self, service: &str) -> Result<Vec<u16>>;

    /// The domain name of `ip`.
    fn reverse_host(&self, ip: IpAddr) -> Result<String>;

    /// The service name of `port`.
    fn reverse_service(&self, port: u16) -> Result<String>;

    /// This host's name.
    fn local_hostname(&self) -> Result<String>;
}

const WELL_KNOWN_SERVICES: &[(&str, u16)] = &[
    ("echo", 7),
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("https", 443),
    ("submission", 587),
];

/// The default backend, resolving through the operating system.
#[derive(Debug, Default)]
pub struct SystemResolverBackend;

impl ResolverBackend for SystemResolverBackend {
    fn resolve_host(&self, name: &str) -> Result<Vec<IpAddr>> {
        let addresses: Vec<IpAddr> = (name, 0u16)
            .to_socket_addrs()
            .map_err(|_| Error::generic(ErrorKind::DnsNoSuchRecord))?
            .map(|addr| addr.ip())
            .collect();
        if addresses.is_empty() {
            return Err(Error::generic(ErrorKind::DnsNoSuchRecord));
        }
        Ok(addresses)
    }

    fn resolve_service(&self, service: &str) -> Result<Vec<u16>> {
        WELL_KNOWN_SERVICES
            .iter()
            .find(|(name, _)| *name == service)
            .map(|(_, port)| vec![*port])
            .ok_or(Error::generic(ErrorKind::DnsNoSuchRecord))
    }

    fn reverse_host(&self, _ip: IpAddr) -> Result<String> {
        Err(Error::generic(ErrorKind::NotImplemented))
    }

    fn reverse_service(&self, port: u16) -> Result<String> {
        WELL_KNOWN_SERVICES
            .iter()
            .find(|(_, known)| *known == port)
            .map(|(name, _)| (*name).to_string())
            .ok_or(Error::generic(ErrorKind::DnsNoSuchRecord))
    }

    fn local_hostname(&self) -> Result<String> {
        #[cfg(target_os = "linux")]
        if let Ok(hostname) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
            return Ok(hostname.trim().to_string());
        }
        std::env::var("HOSTNAME").map_err(|_| Error::generic(ErrorKind::NotImplemented))
    }
}

#[derive(Default)]
struct ResolverState {
    overrides_enabled: bool,
    system_enabled: bool,
    ip_overrides: HashMap<String, Vec<IpAddr>>,
    port_overrides: HashMap<String, Vec<u16>>,
}

/// The callback of an asynchronous endpoint lookup.
pub type GetEndpointCallback = Box<dyn FnOnce(Result<Endpoint>) + Send>;

struct LookupJob {
    text: String,
    options: IpAddressOptions,
    strand: Arc<Strand>,
    callback: GetEndpointCallback,
}

/// Host/service to endpoint resolution with an override store and a
/// pluggable system backend.
pub struct Resolver {
    backend: Arc<dyn ResolverBackend>,
    state: Mutex<ResolverState>,
    cancelled: Mutex<HashSet<OperationToken>>,
    lookups: flume::Sender<LookupJob>,
}

impl Resolver {
    /// Create a resolver over the system backend.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_backend(Arc::new(SystemResolverBackend))
    }

    /// Create a resolver over `backend`.
    pub fn with_backend(backend: Arc<dyn ResolverBackend>) -> Arc<Self> {
        let (sender, receiver) = flume::unbounded::<LookupJob>();
        let resolver = Arc::new(Self {
            backend,
            state: Mutex::new(ResolverState {
                overrides_enabled: true,
                system_enabled: true,
                ip_overrides: HashMap::new(),
                port_overrides: HashMap::new(),
            }),
            cancelled: Mutex::new(HashSet::new()),
            lookups: sender,
        });

        let worker = Arc::downgrade(&resolver);
        std::thread::Builder::new()
            .name("longeron-resolver".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    let Some(resolver) = worker.upgrade() else {
                        break;
                    };
                    resolver.run_lookup(job);
                }
            })
            .ok();

        resolver
    }

    /// Enable or disable the override store.
    pub fn set_overrides_enabled(&self, enabled: bool) {
        self.state.lock().overrides_enabled = enabled;
    }

    /// Enable or disable the system backend.
    pub fn set_system_enabled(&self, enabled: bool) {
        self.state.lock().system_enabled = enabled;
    }

    /// Associate `name` with `addresses` in the override store.
    pub fn set_ip_address_override(&self, name: impl Into<String>, addresses: Vec<IpAddr>) {
        self.state.lock().ip_overrides.insert(name.into(), addresses);
    }

    /// Associate `service` with `ports` in the override store.
    pub fn set_port_override(&self, service: impl Into<String>, ports: Vec<u16>) {
        self.state.lock().port_overrides.insert(service.into(), ports);
    }

    /// All addresses `name` resolves to, after filters.
    pub fn get_ip_address(&self, name: &str, options: &IpAddressOptions) -> Result<Vec<IpAddr>> {
        let (overrides_enabled, system_enabled, overridden) = {
            let state = self.state.lock();
            (
                state.overrides_enabled,
                state.system_enabled,
                state.ip_overrides.get(name).cloned(),
            )
        };

        let mut addresses = match (overrides_enabled, overridden) {
            (true, Some(addresses)) => addresses,
            _ if system_enabled => match self.backend.resolve_host(name) {
                Ok(addresses) => addresses,
                Err(error) => match options.ip_address_fallback {
                    Some(fallback) => vec![fallback],
                    None => return Err(error),
                },
            },
            _ => Vec::new(),
        };

        if let Some(family) = options.ip_address_type {
            addresses.retain(|address| match family {
                IpAddressType::V4 => address.is_ipv4(),
                IpAddressType::V6 => address.is_ipv6(),
            });
        }
        if !options.ip_address_filter.is_empty() {
            addresses.retain(|address| options.ip_address_filter.contains(address));
        }
        if addresses.is_empty() {
            if let Some(fallback) = options.ip_address_fallback {
                addresses.push(fallback);
            }
        }
        if addresses.is_empty() {
            return Err(Error::generic(ErrorKind::DnsNoSuchRecord));
        }
        Ok(addresses)
    }

    /// All ports `service` names, after filters.
    pub fn get_port(&self, service: &str, options: &PortOptions) -> Result<Vec<u16>> {
        let (overrides_enabled, system_enabled, overridden) = {
            let state = self.state.lock();
            (
                state.overrides_enabled,
                state.system_enabled,
                state.port_overrides.get(service).cloned(),
            )
        };

        let mut ports = match (overrides_enabled, overridden) {
            (true, Some(ports)) => ports,
            _ if system_enabled => match self.backend.resolve_service(service) {
                Ok(ports) => ports,
                Err(error) => match options.port_fallback {
                    Some(fallback) => vec![fallback],
                    None => return Err(error),
                },
            },
            _ => Vec::new(),
        };

        if !options.port_filter.is_empty() {
            ports.retain(|port| options.port_filter.contains(port));
        }
        if ports.is_empty() {
            if let Some(fallback) = options.port_fallback {
                ports.push(fallback);
            }
        }
        if ports.is_empty() {
            return Err(Error::generic(ErrorKind::DnsNoSuchRecord));
        }
        Ok(ports)
    }

    /// The domain name of `ip`: the override store first, then the backend.
    pub fn get_domain_name(&self, ip: IpAddr) -> Result<String> {
        {
            let state = self.state.lock();
            if state.overrides_enabled {
                for (name, addresses) in &state.ip_overrides {
                    if addresses.contains(&ip) {
                        return Ok(name.clone());
                    }
                }
            }
        }
        self.backend.reverse_host(ip)
    }

    /// The service name of `port`.
    pub fn get_service_name(&self, port: u16) -> Result<String> {
        {
            let state = self.state.lock();
            if state.overrides_enabled {
                for (service, ports) in &state.port_overrides {
                    if ports.contains(&port) {
                        return Ok(service.clone());
                    }
                }
            }
        }
        self.backend.reverse_service(port)
    }

    /// Resolve `text` (an endpoint literal, `host:port`, or a bare host
    /// with a port fallback) to one endpoint.
    pub fn get_endpoint(&self, text: &str, options: &IpAddressOptions) -> Result<Endpoint> {
        if let Ok(endpoint) = Endpoint::parse(text) {
            return Ok(endpoint);
        }

        let (host, port) = match text.rsplit_once(':') {
            Some((host, port_text)) => match port_text.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (text, None),
            },
            None => (text, None),
        };
        let port = port
            .or(options.port_fallback)
            .ok_or(Error::generic(ErrorKind::Invalid))?;

        let addresses = self.get_ip_address(host, options)?;
        let index = options.ip_address_selector.unwrap_or(0);
        let address = addresses
            .get(index.min(addresses.len() - 1))
            .copied()
            .ok_or(Error::generic(ErrorKind::DnsNoSuchRecord))?;
        trace!(host, %address, port, "resolved");
        Ok(Endpoint::Ip(SocketAddr::new(address, port)))
    }

    /// An address of this host suitable as a default source.
    pub fn get_local_ip_address(&self) -> Result<IpAddr> {
        // A connected datagram handle reveals the route's source address
        // without emitting traffic.
        let socket = crate::syscall::create(crate::syscall::Transport::UdpIpv4Datagram)?;
        let probe = Endpoint::ipv4(std::net::Ipv4Addr::new(192, 0, 2, 1), 9);
        crate::syscall::connect(&socket, &probe)?;
        let local = crate::syscall::local_endpoint(&socket)?;
        local.ip().ok_or(Error::new(ErrorKind::Invalid))
    }

    /// This host's name.
    pub fn get_hostname(&self) -> Result<String> {
        self.backend.local_hostname()
    }

    /// Resolve `text` on the lookup thread and deliver the outcome through
    /// `strand`.
    pub fn get_endpoint_async(
        &self,
        text: String,
        options: IpAddressOptions,
        strand: Arc<Strand>,
        callback: GetEndpointCallback,
    ) {
        let job = LookupJob {
            text,
            options,
            strand,
            callback,
        };
        if let Err(error) = self.lookups.send(job) {
            // The lookup thread is gone; fail on the caller's strand.
            let LookupJob {
                strand, callback, ..
            } = error.into_inner();
            strand.execute(Box::new(move || {
                callback(Err(Error::generic(ErrorKind::DnsTimeout)));
            }));
        }
    }

    /// Complete matching pending asynchronous lookups with `Cancelled`.
    pub fn cancel(&self, token: OperationToken) {
        self.cancelled.lock().insert(token);
    }

    fn run_lookup(self: &Arc<Self>, job: LookupJob) {
        let LookupJob {
            text,
            options,
            strand,
            callback,
        } = job;

        let cancelled = options
            .token
            .is_some_and(|token| self.cancelled.lock().remove(&token));
        let result = if cancelled {
            Err(Error::new(ErrorKind::Cancelled))
        } else if options
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            Err(Error::generic(ErrorKind::DnsTimeout))
        } else {
            self.get_endpoint(&text, &options)
        };

        if let Err(error) = &result {
            debug!(text, %error, "lookup failed");
        }
        strand.execute(Box::new(move || callback(result)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn options() -> IpAddressOptions {
        IpAddressOptions::default()
    }

    #[test]
    fn overrides_consulted_before_system() {
        let resolver = Resolver::new();
        resolver.set_ip_address_override(
            "service.example",
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
        );

        let addresses = resolver
            .get_ip_address("service.example", &options())
            .unwrap();
        assert_eq!(addresses, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);

        resolver.set_overrides_enabled(false);
        resolver.set_system_enabled(false);
        assert!(resolver
            .get_ip_address("service.example", &options())
            .is_err());
    }

    #[test]
    fn fallback_used_when_resolution_fails() {
        let resolver = Resolver::new();
        resolver.set_system_enabled(false);
        let lookup_options = IpAddressOptions {
            ip_address_fallback: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            ..IpAddressOptions::default()
        };
        let addresses = resolver
            .get_ip_address("no-such-host.invalid", &lookup_options)
            .unwrap();
        assert_eq!(addresses, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]);
    }

    #[test]
    fn family_filter_applies() {
        let resolver = Resolver::new();
        resolver.set_ip_address_override(
            "dual.example",
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
                "2001:db8::1".parse().unwrap(),
            ],
        );
        let lookup_options = IpAddressOptions {
            ip_address_type: Some(IpAddressType::V6),
            ..IpAddressOptions::default()
        };
        let addresses = resolver
            .get_ip_address("dual.example", &lookup_options)
            .unwrap();
        assert_eq!(addresses.len(), 1);
        assert!(addresses[0].is_ipv6());
    }

    #[test]
    fn endpoint_from_name_and_port_fallback() {
        let resolver = Resolver::new();
        resolver.set_ip_address_override(
            "api.example",
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4))],
        );

        let endpoint = resolver
            .get_endpoint("api.example:8080", &options())
            .unwrap();
        assert_eq!(endpoint.to_string(), "10.0.0.4:8080");

        let lookup_options = IpAddressOptions {
            port_fallback: Some(81),
            ..IpAddressOptions::default()
        };
        let endpoint = resolver
            .get_endpoint("api.example", &lookup_options)
            .unwrap();
        assert_eq!(endpoint.to_string(), "10.0.0.4:81");
    }

    #[test]
    fn endpoint_literals_bypass_resolution() {
        let resolver = Resolver::new();
        resolver.set_system_enabled(false);
        let endpoint = resolver.get_endpoint("127.0.0.1:5555", &options()).unwrap();
        assert_eq!(endpoint.to_string(), "127.0.0.1:5555");
    }

    #[test]
    fn port_overrides_and_reverse() {
        let resolver = Resolver::new();
        resolver.set_port_override("myservice", vec![4100, 4101]);

        let ports = resolver
            .get_port("myservice", &PortOptions::default())
            .unwrap();
        assert_eq!(ports, vec![4100, 4101]);
        assert_eq!(resolver.get_service_name(4100).unwrap(), "myservice");

        let ports = resolver.get_port("http", &PortOptions::default()).unwrap();
        assert_eq!(ports, vec![80]);
        assert_eq!(resolver.get_service_name(443).unwrap(), "https");
    }

    #[test]
    fn reverse_ip_through_overrides() {
        let resolver = Resolver::new();
        let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        resolver.set_ip_address_override("db.example", vec![address]);
        assert_eq!(resolver.get_domain_name(address).unwrap(), "db.example");
    }
}
