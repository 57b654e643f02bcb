use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::ResolveError;

/// Default DNS port when a nameserver is given without one
const DNS_PORT: u16 = 53;

/// Turns a host name into the addresses that should be monitored
///
/// Backed by DNS here; service-discovery sources implement the same trait.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Parse `ip` or `ip:port` (`[v6]:port` for IPv6) into a nameserver address
pub fn parse_nameserver(s: &str) -> Result<SocketAddr, ResolveError> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| ResolveError::InvalidNameserver(s.to_string()))
}

/// DNS resolver using the system configuration or a fixed nameserver
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Option<Duration>,
}

impl DnsResolver {
    /// Resolver using the system configuration (`/etc/resolv.conf`)
    pub fn system() -> Result<Self, ResolveError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            ResolveError::Lookup {
                host: "<system>".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            resolver,
            timeout: None,
        })
    }

    /// Resolver querying `nameserver` (or the system configuration when None)
    /// with an overall per-lookup `timeout`
    pub fn new(nameserver: Option<SocketAddr>, timeout: Option<Duration>) -> Result<Self, ResolveError> {
        let Some(server) = nameserver else {
            let mut resolver = Self::system()?;
            resolver.timeout = timeout;
            return Ok(resolver);
        };

        let group = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        if let Some(timeout) = timeout {
            opts.timeout = timeout;
        }

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        })
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => ResolveError::NoAddresses {
                host: host.to_string(),
            },
            ResolveErrorKind::Timeout => ResolveError::Timeout {
                host: host.to_string(),
            },
            _ => ResolveError::Lookup {
                host: host.to_string(),
                message: e.to_string(),
            },
        })?;

        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in lookup.iter().map(|ip| ip.to_canonical()) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        // Literal addresses skip DNS entirely
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip.to_canonical()]);
        }

        let addrs = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.lookup(host))
                .await
                .map_err(|_| ResolveError::Timeout {
                    host: host.to_string(),
                })??,
            None => self.lookup(host).await?,
        };

        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses {
                host: host.to_string(),
            });
        }
        Ok(addrs)
    }
}
