use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::chronology::Chronology;
use crate::descriptor::{Endpoint, Transport};
use crate::driver::Reactor;
use crate::error::{Error, Result};
use crate::interests::Trigger;
use crate::queue::{DatagramReadQueue, SendOptions, WatermarkEvent, WriteQueue};
use crate::sys::RawSocket;

use super::core::SocketCore;
use super::options::{MulticastOptions, SocketOptions};

/// `created -> opened -> bound? -> connected? -> closed`, per spec.md
/// §4.E. A datagram socket may skip `connect` entirely (receiving from
/// and sending to arbitrary peers) or fix one peer with `connect`, after
/// which plain `send`/`receive` address that peer implicitly.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Opened,
    Bound,
}

/// Connectionless datagram socket. Unlike [`StreamSocket`], each queued
/// send and each buffered receive carries its own peer address.
///
/// [`StreamSocket`]: super::StreamSocket
pub struct DatagramSocket {
    core: Arc<SocketCore>,
    read_queue: Arc<DatagramReadQueue>,
    write_queue: Arc<WriteQueue>,
    peer: Mutex<Option<SocketAddr>>,
    state: Mutex<State>,
    readable_armed: AtomicBool,
    writable_armed: AtomicBool,
}

impl DatagramSocket {
    pub fn open(
        addr_family: SocketAddr,
        reactor: Arc<Reactor>,
        chronology: Arc<Chronology>,
        options: SocketOptions,
    ) -> Result<DatagramSocket> {
        let raw = RawSocket::from_addr(addr_family, libc::SOCK_DGRAM, 0).map_err(Error::Io)?;
        raw.set_reuse_address().map_err(Error::Io)?;
        let read_watermarks = options.read;
        let write_watermarks = options.write;
        let core = SocketCore::attach(Transport::Datagram, raw, reactor, chronology, options)?;
        Ok(DatagramSocket {
            core,
            read_queue: Arc::new(DatagramReadQueue::new(read_watermarks)),
            write_queue: Arc::new(WriteQueue::new(write_watermarks, None)),
            peer: Mutex::new(None),
            state: Mutex::new(State::Opened),
            readable_armed: AtomicBool::new(false),
            writable_armed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Option<Endpoint> {
        self.core.local_endpoint()
    }

    pub fn bind(&self, endpoint: Endpoint) -> Result<()> {
        let mut state = self.state.lock();
        if *state != State::Opened {
            return Err(Error::Invalid("bind requires the opened state"));
        }
        let addr = endpoint
            .as_socket_addr()
            .ok_or(Error::Invalid("datagram sockets bind to IP endpoints"))?;
        let resolved = {
            let raw = self.core.raw.lock();
            let raw = raw.as_ref().ok_or(Error::Invalid("socket has no descriptor"))?;
            raw.bind(addr).map_err(Error::from_io)?;
            raw.local_addr().map_err(Error::Io)?
        };
        self.core.set_local_endpoint(Endpoint::from_socket_addr(resolved));
        *state = State::Bound;
        Ok(())
    }

    /// Fixes the socket's one peer; `send`/`receive` no longer need an
    /// explicit address once this is set.
    pub fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let addr = endpoint
            .as_socket_addr()
            .ok_or(Error::Invalid("datagram sockets connect to IP endpoints"))?;
        let raw = self.core.raw.lock();
        raw.as_ref()
            .ok_or(Error::Invalid("socket has no descriptor"))?
            .connect(addr)
            .map_err(Error::from_io)?;
        drop(raw);
        *self.peer.lock() = Some(addr);
        Ok(())
    }

    pub fn join_multicast(&self, options: MulticastOptions) -> Result<()> {
        // No raw setsockopt wrapper carries IP_ADD_MEMBERSHIP; reject until
        // one lands rather than silently no-op.
        let _ = options;
        Err(Error::NotImplemented("multicast group membership"))
    }

    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        let _ = ttl;
        Err(Error::NotImplemented("multicast ttl"))
    }

    fn arm_writable(self: &Arc<Self>) {
        if self
            .writable_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        let _ = self
            .core
            .reactor
            .show_writable(&self.core.entry, Trigger::LEVEL, move || this.drain_write());
    }

    fn drain_write(self: &Arc<Self>) {
        let core = Arc::clone(&self.core);
        let peer = *self.peer.lock();
        self.write_queue.drain(usize::MAX, &mut |chunk| {
            let raw = core.raw.lock();
            let raw = raw.as_ref().ok_or(Error::Eof)?;
            match peer {
                Some(addr) => raw.send_to(chunk, addr).map_err(Error::from_io),
                None => raw.send(chunk).map_err(Error::from_io),
            }
        });
        if self.write_queue.total_size() == 0 {
            self.writable_armed.store(false, Ordering::Release);
            let _ = self.core.reactor.hide_writable(&self.core.entry);
        }
    }

    pub fn arm_readable(self: &Arc<Self>) {
        if self
            .readable_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        let _ = self
            .core
            .reactor
            .show_readable(&self.core.entry, Trigger::LEVEL, move || this.fill_read_queue());
    }

    fn fill_read_queue(self: &Arc<Self>) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            if self.read_queue.is_at_high_watermark() {
                let _ = self.core.reactor.hide_readable(&self.core.entry);
                self.readable_armed.store(false, Ordering::Release);
                return;
            }
            let outcome = {
                let raw = self.core.raw.lock();
                match raw.as_ref() {
                    Some(raw) => raw.recv_from(&mut buf),
                    None => return,
                }
            };
            match outcome {
                Ok((n, from)) => {
                    if let Some(WatermarkEvent::Low) = self.read_queue.push(buf[..n].to_vec(), from) {
                        log::trace!("datagram {:?}: read queue back below low watermark", self.core.descriptor());
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("datagram {:?}: recv failed: {}", self.core.descriptor(), err);
                    self.read_queue.shutdown(Error::from_io(err));
                    let _ = self.core.reactor.hide_readable(&self.core.entry);
                    self.readable_armed.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    pub fn send(
        self: &Arc<Self>,
        data: Vec<u8>,
        to: Option<IpAddr>,
        port: Option<u16>,
        options: SendOptions,
        completion: Option<Box<dyn FnOnce(Result<()>) + Send>>,
    ) -> Result<()> {
        if !self.core.can_send() {
            if let Some(completion) = completion {
                completion(Err(Error::Eof));
            }
            return Err(Error::Eof);
        }
        let explicit_peer = match (to, port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        };
        let peer = explicit_peer.or(*self.peer.lock());
        let core = Arc::clone(&self.core);
        let result = self.write_queue.send(data, options, completion, &mut |chunk| {
            let raw = core.raw.lock();
            let raw = raw.as_ref().ok_or(Error::Eof)?;
            match peer {
                Some(addr) => raw.send_to(chunk, addr).map_err(Error::from_io),
                None => raw.send(chunk).map_err(Error::from_io),
            }
        });
        if result.is_ok() && self.write_queue.total_size() > 0 {
            self.arm_writable();
        }
        result
    }

    pub fn receive(
        self: &Arc<Self>,
        max_len: usize,
        deadline: Option<Instant>,
        token: Option<u64>,
        completion: Box<dyn FnOnce(Result<(Vec<u8>, Option<SocketAddr>)>) + Send>,
    ) -> Result<()> {
        self.arm_readable();
        match self.read_queue.take(max_len) {
            Ok(result) => {
                self.core.strand.post(move || completion(Ok(result)));
                Ok(())
            }
            Err(Error::Eof) => {
                completion(Err(Error::Eof));
                Err(Error::Eof)
            }
            Err(Error::WouldBlock) => {
                self.read_queue.register_intent(max_len, deadline, token, completion);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    pub fn cancel(&self, token: u64) -> Result<()> {
        if self.write_queue.cancel(token) || self.read_queue.cancel(token) {
            return Ok(());
        }
        Err(Error::Invalid("not-found"))
    }

    pub fn close(self: &Arc<Self>, callback: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        let write_queue = Arc::clone(&self.write_queue);
        let read_queue = Arc::clone(&self.read_queue);
        self.core.close(
            Error::Cancelled,
            move || {
                write_queue.shutdown(Error::Cancelled);
                read_queue.shutdown(Error::Cancelled);
            },
            move || {
                if let Some(callback) = callback {
                    callback();
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ReactorConfig;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn loopback() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    #[test]
    fn echo_datagram_over_loopback() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let chronology = Arc::new(Chronology::new());

        let a = Arc::new(
            DatagramSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), Default::default())
                .unwrap(),
        );
        a.bind(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr_a = a.local_addr().unwrap().as_socket_addr().unwrap();

        let b = Arc::new(
            DatagramSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), Default::default())
                .unwrap(),
        );
        b.bind(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr_b = b.local_addr().unwrap().as_socket_addr().unwrap();

        a.send(b"ping".to_vec(), Some(addr_b.ip()), Some(addr_b.port()), SendOptions::default(), None)
            .unwrap();

        let received = Arc::new(Mutex::new(None));
        let r = Arc::clone(&received);
        b.receive(
            64,
            None,
            None,
            Box::new(move |res| {
                *r.lock() = Some(res);
            }),
        )
        .unwrap();

        for _ in 0..50 {
            if received.lock().is_some() {
                break;
            }
            reactor
                .poll(Some(Instant::now() + std::time::Duration::from_millis(50)))
                .unwrap();
        }
        let (data, from) = received.lock().take().unwrap().unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(from, Some(addr_a));
    }
}
