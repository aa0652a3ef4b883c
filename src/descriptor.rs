use std::fmt;
#[cfg(unix)]
use std::os::unix::io::RawFd;

/// An opaque, process-wide OS handle.
///
/// This is the sole key under which a socket is known to a [`Driver`] and
/// [`Registry`]. On Unix it wraps a raw file descriptor; it carries no
/// ownership semantics of its own — closing the underlying handle is the
/// responsibility of whoever created it.
///
/// [`Driver`]: crate::driver::Driver
/// [`Registry`]: crate::registry::Registry
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Descriptor(u64);

impl Descriptor {
    #[cfg(unix)]
    pub fn from_raw_fd(fd: RawFd) -> Descriptor {
        Descriptor(fd as u64)
    }

    #[cfg(unix)]
    pub fn as_raw_fd(self) -> RawFd {
        self.0 as RawFd
    }

    /// Build a descriptor directly from its underlying integer value.
    /// Used for non-socket sources registered by value (e.g. the driver's
    /// own waker).
    pub fn from_raw(value: u64) -> Descriptor {
        Descriptor(value)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({})", self.0)
    }
}

/// The address-family / protocol / semantics tuple selected at open time.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Transport {
    /// Connectionless datagram transport over IPv4, IPv6, or a local
    /// domain socket.
    Datagram,
    /// A bound, listening socket accepting incoming stream connections.
    Listener,
    /// A connection-oriented byte stream.
    Stream,
}

impl Transport {
    pub fn is_connectionless(self) -> bool {
        matches!(self, Transport::Datagram)
    }
}

/// A sum type over the endpoints a socket can be bound to, connected to,
/// or receive a datagram from.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum Endpoint {
    V4 {
        address: std::net::Ipv4Addr,
        port: u16,
    },
    V6 {
        address: std::net::Ipv6Addr,
        port: u16,
        scope: u32,
    },
    Local {
        path: std::path::PathBuf,
    },
}

impl Endpoint {
    pub fn v4(address: std::net::Ipv4Addr, port: u16) -> Endpoint {
        Endpoint::V4 { address, port }
    }

    pub fn v6(address: std::net::Ipv6Addr, port: u16, scope: u32) -> Endpoint {
        Endpoint::V6 {
            address,
            port,
            scope,
        }
    }

    pub fn local(path: impl Into<std::path::PathBuf>) -> Endpoint {
        Endpoint::Local { path: path.into() }
    }

    /// Convert to `std::net::SocketAddr`, if this endpoint is IP-based.
    pub fn as_socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Endpoint::V4 { address, port } => {
                Some(std::net::SocketAddr::new((*address).into(), *port))
            }
            Endpoint::V6 {
                address,
                port,
                scope,
            } => Some(std::net::SocketAddr::V6(std::net::SocketAddrV6::new(
                *address, *port, 0, *scope,
            ))),
            Endpoint::Local { .. } => None,
        }
    }

    pub fn from_socket_addr(addr: std::net::SocketAddr) -> Endpoint {
        match addr {
            std::net::SocketAddr::V4(v4) => Endpoint::v4(*v4.ip(), v4.port()),
            std::net::SocketAddr::V6(v6) => Endpoint::v6(*v6.ip(), v6.port(), v6.scope_id()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4 { address, port } => write!(f, "{}:{}", address, port),
            Endpoint::V6 {
                address,
                port,
                scope,
            } => {
                if *scope == 0 {
                    write!(f, "[{}]:{}", address, port)
                } else {
                    write!(f, "[{}%{}]:{}", address, scope, port)
                }
            }
            Endpoint::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn endpoint_round_trips_through_socket_addr() {
        let endpoint = Endpoint::v4(Ipv4Addr::new(127, 0, 0, 1), 4242);
        let addr = endpoint.as_socket_addr().unwrap();
        assert_eq!(Endpoint::from_socket_addr(addr), endpoint);
    }

    #[test]
    fn local_endpoint_has_no_socket_addr() {
        let endpoint = Endpoint::local("/tmp/nexio.sock");
        assert!(endpoint.as_socket_addr().is_none());
    }
}
