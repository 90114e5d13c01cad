//! Address value type (spec.md §3 "Address").
//!
//! Wraps `std::net::SocketAddr` — the byte-correct, already-idiomatic
//! representation of an IPv4/IPv6 endpoint — with the socket type and
//! protocol number the spec's data model calls for, and name resolution that
//! returns an empty list rather than an error for names that don't resolve
//! (spec.md §4.1).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Address family preference used when resolving a host name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

/// Socket type, mirroring `SOCK_STREAM`/`SOCK_DGRAM`. The core only
/// exercises `Stream`; `Datagram` is carried for completeness of the data
/// model (UDP itself is out of scope, spec.md §1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    pub(crate) fn raw(self) -> libc::c_int {
        match self {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// A value representing an IPv4 or IPv6 endpoint bound to a transport
/// protocol. Cheaply copyable; owned by whichever socket it initialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Address {
    addr: SocketAddr,
    kind: SocketKind,
    protocol: i32,
}

impl Address {
    pub fn new(addr: SocketAddr, kind: SocketKind, protocol: i32) -> Address {
        Address {
            addr,
            kind,
            protocol,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Address {
        Address::new(addr, SocketKind::Stream, libc::IPPROTO_TCP)
    }

    /// Resolve textual `host:port` to every matching address, honoring a
    /// family preference. Names that do not resolve return an empty list,
    /// not an `Err` (spec.md §4.1).
    pub fn resolve(host_port: &str, family: Family, kind: SocketKind) -> io::Result<Vec<Address>> {
        let resolved = match host_port.to_socket_addrs() {
            Ok(iter) => iter.collect::<Vec<_>>(),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => return Ok(Vec::new()),
            Err(_) => Vec::new(),
        };

        let protocol = match kind {
            SocketKind::Stream => libc::IPPROTO_TCP,
            SocketKind::Datagram => libc::IPPROTO_UDP,
        };

        Ok(resolved
            .into_iter()
            .filter(|addr| match family {
                Family::Any => true,
                Family::V4 => addr.is_ipv4(),
                Family::V6 => addr.is_ipv6(),
            })
            .map(|addr| Address::new(addr, kind, protocol))
            .collect())
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The raw big-endian address bytes (4 for v4, 16 for v6), matching the
    /// data model's "raw binary address bytes" attribute.
    pub fn raw_bytes(&self) -> Vec<u8> {
        match self.addr.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    pub fn from_raw_bytes(
        bytes: &[u8],
        port: u16,
        kind: SocketKind,
        protocol: i32,
    ) -> io::Result<Address> {
        let ip = match bytes.len() {
            4 => IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address byte length must be 4 or 16",
                ))
            }
        };
        Ok(Address::new(SocketAddr::new(ip, port), kind, protocol))
    }

    /// Round-trips through the printable form (spec.md §8, property 7).
    pub fn parse(text: &str, kind: SocketKind, protocol: i32) -> io::Result<Address> {
        let addr: SocketAddr = text
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        Ok(Address::new(addr, kind, protocol))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_printable_form() {
        for (bytes, port) in [
            (vec![127, 0, 0, 1], 8080u16),
            (vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443u16),
        ] {
            let original =
                Address::from_raw_bytes(&bytes, port, SocketKind::Stream, libc::IPPROTO_TCP)
                    .unwrap();
            let printed = original.to_string();
            let parsed = Address::parse(&printed, SocketKind::Stream, libc::IPPROTO_TCP).unwrap();
            assert_eq!(original, parsed);
        }
    }

    #[test]
    fn unresolvable_name_yields_empty_list_not_error() {
        let addrs =
            Address::resolve("this-name-does-not-resolve.invalid:80", Family::Any, SocketKind::Stream)
                .unwrap();
        assert!(addrs.is_empty());
    }

    #[test]
    fn resolve_filters_by_family() {
        let addrs = Address::resolve("127.0.0.1:9000", Family::V6, SocketKind::Stream).unwrap();
        assert!(addrs.is_empty());
        let addrs = Address::resolve("127.0.0.1:9000", Family::V4, SocketKind::Stream).unwrap();
        assert_eq!(addrs.len(), 1);
    }
}
