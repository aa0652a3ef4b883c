use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Thin wrapper over the raw `socket(2)`/`bind(2)`/`listen(2)`/`accept4(2)`/
/// `connect(2)` family, used by [`crate::socket::SocketCore`] to open
/// descriptors before they're handed to the [`Driver`].
///
/// Grounded on the teacher crate's `sys/unix/socket.rs` helper of the same
/// name and shape; this crate's version is pared down to what the Socket
/// layer actually needs (no uds `socketpair`, no platform `fcntl` fallback
/// for non-Linux Unixes the teacher also supports, since this crate targets
/// the Linux `epoll` backend only per DESIGN.md).
///
/// [`Driver`]: crate::driver::Driver
#[derive(Debug)]
pub struct RawSocket {
    fd: OwnedFd,
}

impl RawSocket {
    pub fn new(domain: libc::c_int, socket_type: libc::c_int, protocol: libc::c_int) -> io::Result<RawSocket> {
        let socket_type = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        let raw = check(unsafe { libc::socket(domain, socket_type, protocol) })?;
        Ok(RawSocket {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn from_addr(addr: SocketAddr, socket_type: libc::c_int, protocol: libc::c_int) -> io::Result<RawSocket> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        RawSocket::new(domain, socket_type, protocol)
    }

    pub fn from_unix(socket_type: libc::c_int) -> io::Result<RawSocket> {
        RawSocket::new(libc::AF_UNIX, socket_type, 0)
    }

    pub unsafe fn from_raw_fd(fd: RawFd) -> RawSocket {
        RawSocket {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    pub fn set_reuse_address(&self) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = socket_addr_to_raw(addr);
        check(unsafe { libc::bind(self.fd.as_raw_fd(), &storage as *const _ as *const libc::sockaddr, len) })
            .map(|_| ())
    }

    pub fn bind_unix(&self, path: &std::path::Path) -> io::Result<()> {
        let (storage, len) = unix_addr_to_raw(path)?;
        check(unsafe { libc::bind(self.fd.as_raw_fd(), &storage as *const _ as *const libc::sockaddr, len) })
            .map(|_| ())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        check(unsafe { libc::listen(self.fd.as_raw_fd(), backlog) }).map(|_| ())
    }

    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = socket_addr_to_raw(addr);
        self.connect_raw(&storage as *const _ as *const libc::sockaddr, len)
    }

    pub fn connect_unix(&self, path: &std::path::Path) -> io::Result<()> {
        let (storage, len) = unix_addr_to_raw(path)?;
        self.connect_raw(&storage as *const _ as *const libc::sockaddr, len)
    }

    fn connect_raw(&self, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()> {
        match check(unsafe { libc::connect(self.fd.as_raw_fd(), addr, len) }) {
            Ok(_) => Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// `accept4` with `SOCK_NONBLOCK | SOCK_CLOEXEC` so the child inherits
    /// non-blocking mode without a second `fcntl` round trip.
    pub fn accept(&self) -> io::Result<(RawSocket, Option<SocketAddr>)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let raw = check(unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        })?;
        let socket = unsafe { RawSocket::from_raw_fd(raw) };
        let addr = raw_to_socket_addr(&storage, len);
        Ok((socket, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        check(unsafe { libc::getsockname(self.fd.as_raw_fd(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
        raw_to_socket_addr(&storage, len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an IP socket"))
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut payload: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        check(unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut payload as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        Ok(match payload {
            0 => None,
            code => Some(io::Error::from_raw_os_error(code)),
        })
    }

    pub fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        self.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, enabled as libc::c_int)
    }

    pub fn set_keepalive(&self, enabled: bool) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, enabled as libc::c_int)
    }

    pub fn set_linger(&self, duration: Option<Duration>) -> io::Result<()> {
        let linger = libc::linger {
            l_onoff: duration.is_some() as libc::c_int,
            l_linger: duration.map(|d| d.as_secs() as libc::c_int).unwrap_or(0),
        };
        check(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
    }

    fn setsockopt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        check(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = check(unsafe {
            libc::send(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len(), 0) as libc::c_int
        })?;
        Ok(n as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = check(unsafe {
            libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) as libc::c_int
        })?;
        Ok(n as usize)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let (storage, len) = socket_addr_to_raw(addr);
        let n = check(unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            ) as libc::c_int
        })?;
        Ok(n as usize)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = check(unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            ) as libc::c_int
        })?;
        Ok((n as usize, raw_to_socket_addr(&storage, len)))
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn socket_addr_to_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, raw);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, raw);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage, _len: libc::socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let raw = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(raw.sin_addr.s_addr.to_ne_bytes()));
            Some(SocketAddr::new(ip.into(), u16::from_be(raw.sin_port)))
        }
        libc::AF_INET6 => {
            let raw = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(raw.sin6_addr.s6_addr);
            Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                u16::from_be(raw.sin6_port),
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn unix_addr_to_raw(path: &std::path::Path) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= 108 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unix socket path too long"));
    }
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let raw = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
    raw.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in raw.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((storage, len as libc::socklen_t))
}
