//! DNS resolution boundary.
//!
//! Resolution itself is delegated to the platform (`getaddrinfo` through
//! `ToSocketAddrs`). The reactor only needs a blocking `lookup` and a way to
//! run it without stalling the scheduler, which `spawn_lookup` provides.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::sched::Promise;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    /// A records.
    V4,
    /// AAAA records.
    V6,
}

impl AddrFamily {
    pub fn matches(self, ip: IpAddr) -> bool {
        match self {
            AddrFamily::V4 => ip.is_ipv4(),
            AddrFamily::V6 => ip.is_ipv6(),
        }
    }
}

pub trait Resolver: Send + Sync {
    /// Blocking lookup of all addresses of one family.
    fn lookup(&self, host: &str, family: AddrFamily) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn lookup(&self, host: &str, family: AddrFamily) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(if family.matches(ip) { vec![ip] } else { Vec::new() });
        }
        let mut ips: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .filter(|ip| family.matches(*ip))
            .collect();
        ips.dedup();
        Ok(ips)
    }
}

/// Fixed host table, for tests and pinned deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, ip: IpAddr) -> &mut Self {
        self.entries.entry(host.into()).or_default().push(ip);
        self
    }
}

impl Resolver for StaticResolver {
    fn lookup(&self, host: &str, family: AddrFamily) -> io::Result<Vec<IpAddr>> {
        Ok(self
            .entries
            .get(host)
            .map(|ips| ips.iter().copied().filter(|ip| family.matches(*ip)).collect())
            .unwrap_or_default())
    }
}

/// Run a lookup on a detached thread.
pub fn spawn_lookup(
    resolver: Arc<dyn Resolver>,
    host: String,
    family: AddrFamily,
) -> Promise<io::Result<Vec<IpAddr>>> {
    let promise = Promise::new();
    let job = {
        let host = host.clone();
        move || resolver.lookup(&host, family)
    };
    if let Err(err) = promise.fulfil_off_thread(job) {
        tracing::warn!(host = %host, error = %err, "Could not spawn lookup thread");
        promise.fulfil(Err(err));
    }
    promise
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn literals_skip_the_resolver() {
        let v4 = SystemResolver.lookup("127.0.0.1", AddrFamily::V4).unwrap();
        assert_eq!(v4, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert!(SystemResolver.lookup("127.0.0.1", AddrFamily::V6).unwrap().is_empty());
    }

    #[test]
    fn static_resolver_filters_by_family() {
        let mut resolver = StaticResolver::new();
        resolver
            .insert("svc.test", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .insert("svc.test", IpAddr::V6(Ipv6Addr::LOCALHOST));

        assert_eq!(resolver.lookup("svc.test", AddrFamily::V4).unwrap().len(), 1);
        assert_eq!(resolver.lookup("svc.test", AddrFamily::V6).unwrap().len(), 1);
        assert!(resolver.lookup("other.test", AddrFamily::V4).unwrap().is_empty());
    }

    #[test]
    fn spawned_lookup_fulfils_promise() {
        let mut resolver = StaticResolver::new();
        resolver.insert("svc.test", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        let promise = spawn_lookup(Arc::new(resolver), "svc.test".into(), AddrFamily::V4);
        promise.await_fulfilment();
        let ips = promise.take().unwrap().unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]);
    }
}
