//! Destination resolution per domain strategy.

use portway_core::{Address, Destination, ProxyError, ProxyResult};
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use tokio::net;
use tracing::{debug, warn};

/// How domain destinations are turned into socket addresses. IP
/// destinations are always used as given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainStrategy {
    /// Use whatever the system resolver returns, in its order.
    #[default]
    AsIs,
    /// Resolve, trying IPv4 addresses before IPv6.
    UseIp,
    UseIpv4,
    UseIpv6,
}

/// Candidate socket addresses for `destination`, in dial order.
pub async fn resolve(destination: &Destination, strategy: DomainStrategy) -> ProxyResult<Vec<SocketAddr>> {
    let domain = match &destination.address {
        Address::Ip(ip) => return Ok(vec![SocketAddr::new(*ip, destination.port)]),
        Address::Domain(d) => d,
        Address::Path(p) => {
            return Err(ProxyError::Dispatch(format!("cannot dial path {p} over tcp")))
        }
    };

    let found: Vec<SocketAddr> = match net::lookup_host((domain.as_str(), destination.port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!(domain = %domain, error = %e, "DNS resolution failed");
            return Err(not_found(domain, &e.to_string()));
        }
    };

    let mut addrs: Vec<SocketAddr> = match strategy {
        DomainStrategy::AsIs | DomainStrategy::UseIp => found,
        DomainStrategy::UseIpv4 => found.into_iter().filter(SocketAddr::is_ipv4).collect(),
        DomainStrategy::UseIpv6 => found.into_iter().filter(SocketAddr::is_ipv6).collect(),
    };
    if strategy == DomainStrategy::UseIp {
        // Stable: keeps resolver order within each family.
        addrs.sort_by_key(|a| a.is_ipv6());
    }
    if addrs.is_empty() {
        return Err(not_found(domain, &format!("no addresses for {strategy:?}")));
    }
    debug!(domain = %domain, count = addrs.len(), "resolved");
    Ok(addrs)
}

fn not_found(domain: &str, reason: &str) -> ProxyError {
    ProxyError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("cannot resolve {domain}: {reason}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv6Addr};

    #[tokio::test]
    async fn ip_destinations_bypass_lookup() {
        let dest = Destination::tcp(Address::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)), 8080);
        let addrs = resolve(&dest, DomainStrategy::UseIpv4).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn localhost_ipv4() {
        let dest = Destination::tcp(Address::parse("localhost"), 80);
        let addrs = resolve(&dest, DomainStrategy::UseIpv4).await.unwrap();
        assert!(addrs.iter().all(SocketAddr::is_ipv4));
        assert!(addrs.iter().any(|a| a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn unresolvable_maps_to_host_unreachable() {
        let dest = Destination::tcp(Address::parse("this.host.does.not.exist.invalid"), 80);
        let err = resolve(&dest, DomainStrategy::AsIs).await.unwrap_err();
        assert_eq!(err.socks_reply_code(), 0x04);
    }

    #[test]
    fn strategy_names() {
        #[derive(Deserialize)]
        struct W {
            s: DomainStrategy,
        }
        let w: W = toml::from_str("s = \"use-ipv6\"").unwrap();
        assert_eq!(w.s, DomainStrategy::UseIpv6);
        let w: W = toml::from_str("s = \"as-is\"").unwrap();
        assert_eq!(w.s, DomainStrategy::AsIs);
    }
}
