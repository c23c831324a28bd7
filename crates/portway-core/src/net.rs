//! Addresses and destinations.
//!
//! A [`Destination`] is what a handshake learns from the client and what
//! [`Dispatcher`](crate::routing::Dispatcher) turns into a link.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Transport network a destination lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
        })
    }
}

/// A host: an IP literal, a domain name, or a filesystem path for domain
/// sockets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
    Path(String),
}

impl Address {
    /// Parse a host string, preferring an IP literal.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(s.to_string()),
        }
    }

    pub fn any() -> Self {
        Address::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Address::Ip(_) => false,
            Address::Domain(d) => d.is_empty(),
            Address::Path(p) => p.is_empty(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(v6)) => write!(f, "[{v6}]"),
            Address::Ip(ip) => write!(f, "{ip}"),
            Address::Domain(d) => f.write_str(d),
            Address::Path(p) => f.write_str(p),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

/// Network + address + port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn tcp(address: Address, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address,
            port,
        }
    }

    pub fn udp(address: Address, port: u16) -> Self {
        Self {
            network: Network::Udp,
            address,
            port,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            network: Network::Unix,
            address: Address::Path(path.into()),
            port: 0,
        }
    }

    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        Self {
            network,
            address: Address::Ip(addr.ip()),
            port: addr.port(),
        }
    }

    /// A destination is usable only when its address is non-empty and, for
    /// port-addressed networks, its port is non-zero.
    pub fn is_valid(&self) -> bool {
        if self.address.is_empty() {
            return false;
        }
        match self.network {
            Network::Unix => true,
            Network::Tcp | Network::Udp => self.port != 0,
        }
    }

    /// `host:port` form suitable for `TcpStream::connect`.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Network::Unix => write!(f, "unix:{}", self.address),
            n => write!(f, "{n}:{}:{}", self.address, self.port),
        }
    }
}
