use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::chronology::Chronology;
use crate::descriptor::{Descriptor, Endpoint, Transport};
use crate::driver::Reactor;
use crate::error::{Error, Result};
use crate::interests::Trigger;
use crate::queue::AcceptQueue;
use crate::sys::RawSocket;

use super::core::SocketCore;
use super::options::SocketOptions;
use super::stream::StreamSocket;

const DEFAULT_BACKLOG: i32 = 1024;

/// `created -> opened -> bound -> listening -> closed`, per spec.md §4.E.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Opened,
    Bound,
    Listening,
}

/// Connection-oriented listening socket: hands accepted connections out
/// as already-connected [`StreamSocket`]s.
///
/// `accept(2)` yields an owned descriptor, but [`AcceptQueue`] only tracks
/// [`Descriptor`] identity (it's shared by the connectionless Proactor
/// path too, where there's no child socket to own). This type bridges the
/// two by holding the actual [`RawSocket`] in `pending_children`, keyed by
/// the same `Descriptor` the queue carries, until `accept()` claims it.
pub struct ListenerSocket {
    core: Arc<SocketCore>,
    accept_queue: Arc<AcceptQueue>,
    pending_children: Mutex<HashMap<Descriptor, RawSocket>>,
    state: Mutex<State>,
    accept_options: SocketOptions,
    readable_armed: AtomicBool,
}

impl ListenerSocket {
    pub fn open(
        addr_family: SocketAddr,
        reactor: Arc<Reactor>,
        chronology: Arc<Chronology>,
        options: SocketOptions,
    ) -> Result<ListenerSocket> {
        let raw = RawSocket::from_addr(addr_family, libc::SOCK_STREAM, 0).map_err(Error::Io)?;
        raw.set_reuse_address().map_err(Error::Io)?;
        let accept_watermarks = options.accept;
        let accept_options = options;
        let core = SocketCore::attach(Transport::Listener, raw, reactor, chronology, options)?;
        Ok(ListenerSocket {
            core,
            accept_queue: Arc::new(AcceptQueue::new(accept_watermarks)),
            pending_children: Mutex::new(HashMap::new()),
            state: Mutex::new(State::Opened),
            accept_options,
            readable_armed: AtomicBool::new(false),
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
            .ok_or(Error::Invalid("listener sockets bind to IP endpoints"))?;
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

    pub fn listen(self: &Arc<Self>, backlog: Option<i32>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != State::Bound {
            return Err(Error::Invalid("listen requires a bound socket"));
        }
        {
            let raw = self.core.raw.lock();
            raw.as_ref()
                .ok_or(Error::Invalid("socket has no descriptor"))?
                .listen(backlog.unwrap_or(DEFAULT_BACKLOG))
                .map_err(Error::from_io)?;
        }
        *state = State::Listening;
        drop(state);
        self.arm_readable();
        Ok(())
    }

    fn arm_readable(self: &Arc<Self>) {
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
            .show_readable(&self.core.entry, Trigger::LEVEL, move || this.accept_ready());
    }

    /// Drains `accept(2)` into the accept queue until it would block or
    /// the queue reaches its high watermark (spec.md §4.D: the Driver
    /// stops filling a queue once it is full, resuming once the listener
    /// is below `acceptLow` again via a later `accept()` call).
    fn accept_ready(self: &Arc<Self>) {
        loop {
            if self.accept_queue.is_at_high_watermark() {
                let _ = self.core.reactor.hide_readable(&self.core.entry);
                self.readable_armed.store(false, Ordering::Release);
                return;
            }
            let accepted = {
                let raw = self.core.raw.lock();
                match raw.as_ref() {
                    Some(raw) => raw.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((child, _peer)) => {
                    use std::os::fd::AsRawFd;
                    let descriptor = Descriptor::from_raw_fd(child.as_raw_fd());
                    self.pending_children.lock().insert(descriptor, child);
                    self.accept_queue.push(descriptor);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("listener {:?}: accept failed: {}", self.core.descriptor(), err);
                    let leftover = self.accept_queue.shutdown(Error::from_io(err));
                    self.drop_leftover(leftover);
                    let _ = self.core.reactor.hide_readable(&self.core.entry);
                    self.readable_armed.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    fn drop_leftover(&self, descriptors: Vec<Descriptor>) {
        let mut pending = self.pending_children.lock();
        for descriptor in descriptors {
            pending.remove(&descriptor);
        }
    }

    fn materialize(self: &Arc<Self>, descriptor: Descriptor) -> Result<StreamSocket> {
        let raw = self
            .pending_children
            .lock()
            .remove(&descriptor)
            .ok_or(Error::Internal("accepted descriptor missing from pending table"))?;
        StreamSocket::from_accepted(
            raw,
            Arc::clone(&self.core.reactor),
            Arc::clone(&self.core.chronology),
            self.accept_options,
        )
    }

    pub fn accept(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        token: Option<u64>,
        completion: Box<dyn FnOnce(Result<StreamSocket>) + Send>,
    ) -> Result<()> {
        if *self.state.lock() != State::Listening {
            return Err(Error::Invalid("accept requires the listening state"));
        }
        match self.accept_queue.take() {
            Ok(descriptor) => {
                let result = self.materialize(descriptor);
                self.core.strand.post(move || completion(result));
                self.arm_readable();
                Ok(())
            }
            Err(Error::Eof) => {
                completion(Err(Error::Eof));
                Err(Error::Eof)
            }
            Err(Error::WouldBlock) => {
                let this = Arc::clone(self);
                self.accept_queue.register_intent(
                    deadline,
                    token,
                    Box::new(move |result| match result {
                        Ok(descriptor) => completion(this.materialize(descriptor)),
                        Err(err) => completion(Err(err)),
                    }),
                );
                self.arm_readable();
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    pub fn cancel(&self, token: u64) -> Result<()> {
        if self.accept_queue.cancel(token) {
            return Ok(());
        }
        Err(Error::Invalid("not-found"))
    }

    pub fn close(self: &Arc<Self>, callback: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        let accept_queue = Arc::clone(&self.accept_queue);
        let this = Arc::clone(self);
        self.core.close(
            Error::Cancelled,
            move || {
                let leftover = accept_queue.shutdown(Error::Cancelled);
                this.drop_leftover(leftover);
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
    fn accept_delivers_connected_stream() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let chronology = Arc::new(Chronology::new());

        let listener = Arc::new(
            ListenerSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), Default::default())
                .unwrap(),
        );
        listener.bind(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.listen(None).unwrap();
        let addr = listener.local_addr().unwrap().as_socket_addr().unwrap();

        let client = RawSocket::from_addr(addr, libc::SOCK_STREAM, 0).unwrap();
        client.connect(addr).unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&accepted);
        listener
            .accept(None, None, Box::new(move |res| {
                if res.is_ok() {
                    a.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();

        for _ in 0..50 {
            if accepted.load(Ordering::SeqCst) > 0 {
                break;
            }
            reactor
                .poll(Some(Instant::now() + std::time::Duration::from_millis(50)))
                .unwrap();
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
