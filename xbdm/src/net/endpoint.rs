use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use crate::Error;

/// An IPv4 address and TCP port.
///
/// Hostnames are resolved exactly once, at construction, so an `Endpoint`
/// never performs DNS work later on (in particular not on the reactor
/// thread). Endpoints order lexicographically by address then port and are
/// usable as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    addr: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from already-resolved parts.
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint { addr, port }
    }

    /// Resolves `host` (a dotted quad or a hostname) once, keeping the first
    /// IPv4 result.
    pub fn resolve(host: &str, port: u16) -> Result<Self, Error> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Ok(Endpoint { addr, port });
        }
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(Error::Network)?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            });
        match addrs {
            Some(addr) => Ok(Endpoint { addr, port }),
            None => Err(Error::InvalidArgument(format!(
                "`{host}` has no IPv4 address"
            ))),
        }
    }

    /// The IPv4 address.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The same endpoint with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Endpoint {
            addr: self.addr,
            port,
        }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Endpoint {
            addr: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddr::V4(SocketAddrV4::new(endpoint.addr, endpoint.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_dotted_quads_without_dns() {
        let endpoint = Endpoint::resolve("10.0.1.2", 731).unwrap();
        assert_eq!(endpoint.addr(), Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(endpoint.port(), 731);
        assert_eq!(endpoint.to_string(), "10.0.1.2:731");
    }

    #[test]
    fn orders_by_address_then_port() {
        let a = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 731);
        let b = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 100);
        let c = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 731);
        assert!(a < b);
        assert!(b < c);
    }
}
