use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::chronology::{Chronology, TimerHandle};
use crate::descriptor::{Endpoint, Transport};
use crate::driver::Reactor;
use crate::error::{Error, Result};
use crate::interests::Trigger;
use crate::queue::{ReadQueue, SendOptions, WatermarkEvent, WriteQueue};
use crate::sys::RawSocket;

use super::core::SocketCore;
use super::options::SocketOptions;
use super::shutdown::{Direction, Initiator};

/// `created -> opened -> bound? -> connecting -> connected ->
/// (shutting-send | shutting-receive)* -> closed`, per spec.md §4.E.
/// Illegal transitions return `Error::Invalid`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Opened,
    Bound,
    Connecting,
    Connected,
}

type ConnectCompletion = Box<dyn FnOnce(Result<()>) + Send>;

struct PendingConnect {
    completion: Mutex<Option<ConnectCompletion>>,
    timer: Mutex<Option<TimerHandle>>,
}

/// Connection-oriented byte stream socket.
pub struct StreamSocket {
    core: Arc<SocketCore>,
    read_queue: Arc<ReadQueue>,
    write_queue: Arc<WriteQueue>,
    state: Mutex<State>,
    pending_connect: Mutex<Option<Arc<PendingConnect>>>,
    readable_armed: AtomicBool,
    writable_armed: AtomicBool,
}

impl StreamSocket {
    pub fn open(
        addr_family: SocketAddr,
        reactor: Arc<Reactor>,
        chronology: Arc<Chronology>,
        options: SocketOptions,
    ) -> Result<StreamSocket> {
        let raw = RawSocket::from_addr(addr_family, libc::SOCK_STREAM, 0).map_err(Error::Io)?;
        raw.set_reuse_address().map_err(Error::Io)?;
        if options.no_delay {
            raw.set_nodelay(true).map_err(Error::Io)?;
        }
        Self::from_raw(raw, reactor, chronology, options, State::Opened)
    }

    /// Build a `StreamSocket` from an already-connected descriptor, as
    /// produced by a listener's `accept`.
    pub(crate) fn from_accepted(
        raw: RawSocket,
        reactor: Arc<Reactor>,
        chronology: Arc<Chronology>,
        options: SocketOptions,
    ) -> Result<StreamSocket> {
        Self::from_raw(raw, reactor, chronology, options, State::Connected)
    }

    fn from_raw(
        raw: RawSocket,
        reactor: Arc<Reactor>,
        chronology: Arc<Chronology>,
        options: SocketOptions,
        initial: State,
    ) -> Result<StreamSocket> {
        let read_watermarks = options.read;
        let write_watermarks = options.write;
        let core = SocketCore::attach(Transport::Stream, raw, reactor, chronology, options)?;
        Ok(StreamSocket {
            core,
            read_queue: Arc::new(ReadQueue::new(read_watermarks)),
            write_queue: Arc::new(WriteQueue::new(write_watermarks, None)),
            state: Mutex::new(initial),
            pending_connect: Mutex::new(None),
            readable_armed: AtomicBool::new(false),
            writable_armed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Option<Endpoint> {
        self.core.local_endpoint()
    }

    pub fn bind(&self, endpoint: Endpoint, _reuse_address: bool) -> Result<()> {
        let mut state = self.state.lock();
        if *state != State::Opened {
            return Err(Error::Invalid("bind requires the opened state"));
        }
        let addr = endpoint
            .as_socket_addr()
            .ok_or(Error::Invalid("stream sockets bind to IP endpoints"))?;
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

    /// Returns `Ok(())` immediately with the state moved to `connecting`;
    /// `callback` fires exactly once with the final outcome.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: Endpoint,
        deadline: Option<Instant>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Opened | State::Bound) {
                return Err(Error::Invalid("connect requires opened or bound state"));
            }
            *state = State::Connecting;
        }
        let addr = endpoint
            .as_socket_addr()
            .ok_or(Error::Invalid("stream sockets connect to IP endpoints"))?;

        {
            let raw = self.core.raw.lock();
            raw.as_ref()
                .ok_or(Error::Invalid("socket has no descriptor"))?
                .connect(addr)
                .map_err(Error::from_io)?;
        }

        let pending = Arc::new(PendingConnect {
            completion: Mutex::new(Some(Box::new(callback))),
            timer: Mutex::new(None),
        });
        *self.pending_connect.lock() = Some(Arc::clone(&pending));

        if let Some(deadline) = deadline {
            let this = Arc::clone(self);
            let pending_for_timer = Arc::clone(&pending);
            let handle = self.core.deadline_timer(deadline, move || {
                this.resolve_connect(&pending_for_timer, Err(Error::Timeout));
            });
            *pending.timer.lock() = Some(handle);
        }

        let this = Arc::clone(self);
        let pending_for_cb = Arc::clone(&pending);
        self.core.reactor.show_writable(&self.core.entry, Trigger::LEVEL.one_shot(), move || {
            let result = this.core.raw.lock().as_ref().map(|raw| raw.take_error());
            match result {
                Some(Ok(None)) => this.resolve_connect(&pending_for_cb, Ok(())),
                Some(Ok(Some(err))) => this.resolve_connect(&pending_for_cb, Err(Error::from_io(err))),
                Some(Err(err)) => this.resolve_connect(&pending_for_cb, Err(Error::from_io(err))),
                None => this.resolve_connect(&pending_for_cb, Err(Error::Invalid("socket closed mid-connect"))),
            }
        })?;
        Ok(())
    }

    fn resolve_connect(self: &Arc<Self>, pending: &Arc<PendingConnect>, result: Result<()>) {
        let completion = pending.completion.lock().take();
        let Some(completion) = completion else { return };
        if let Some(timer) = pending.timer.lock().take() {
            self.core.chronology.cancel_timer(timer);
        }
        let _ = self.core.reactor.hide_writable(&self.core.entry);
        *self.pending_connect.lock() = None;
        if result.is_ok() {
            *self.state.lock() = State::Connected;
        }
        self.core.strand.post(move || completion(result));
    }

    /// `send`/`receive`/`cancel` are only meaningful once connected; the
    /// accepted-socket constructor starts in that state directly.
    fn require_connected(&self) -> Result<()> {
        if *self.state.lock() != State::Connected {
            return Err(Error::Invalid("stream socket is not connected"));
        }
        Ok(())
    }

    pub fn send(
        self: &Arc<Self>,
        data: Vec<u8>,
        options: SendOptions,
        completion: Option<Box<dyn FnOnce(Result<()>) + Send>>,
    ) -> Result<()> {
        self.require_connected()?;
        if !self.core.can_send() {
            if let Some(completion) = completion {
                completion(Err(Error::Eof));
            }
            return Err(Error::Eof);
        }
        let core = Arc::clone(&self.core);
        let result = self.write_queue.send(data, options, completion, &mut |chunk| {
            let raw = core.raw.lock();
            raw.as_ref()
                .ok_or(Error::Eof)?
                .send(chunk)
                .map_err(Error::from_io)
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
        completion: Box<dyn FnOnce(Result<(Vec<u8>, usize)>) + Send>,
    ) -> Result<()> {
        self.require_connected()?;
        match self.read_queue.take(max_len) {
            Ok(result) => {
                let completion = completion;
                self.core.strand.post(move || completion(Ok(result)));
                Ok(())
            }
            Err(Error::Eof) => {
                completion(Err(Error::Eof));
                Err(Error::Eof)
            }
            Err(Error::WouldBlock) => {
                self.read_queue.register_intent(max_len, deadline, token, completion);
                self.arm_readable();
                Ok(())
            }
            Err(other) => Err(other),
        }
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
        self.write_queue.drain(usize::MAX, &mut |chunk| {
            let raw = core.raw.lock();
            raw.as_ref()
                .ok_or(Error::Eof)?
                .send(chunk)
                .map_err(Error::from_io)
        });
        if self.write_queue.total_size() == 0 {
            self.writable_armed.store(false, Ordering::Release);
            let _ = self.core.reactor.hide_writable(&self.core.entry);
        }
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
                    Some(raw) => raw.recv(&mut buf),
                    None => return,
                }
            };
            match outcome {
                Ok(0) => {
                    self.core.mark_shutdown(Direction::Receive, Initiator::Remote);
                    self.read_queue.shutdown(Error::Eof);
                    let _ = self.core.reactor.hide_readable(&self.core.entry);
                    self.readable_armed.store(false, Ordering::Release);
                    return;
                }
                Ok(n) => {
                    if let Some(WatermarkEvent::Low) = self.read_queue.fill(&buf[..n]) {
                        log::trace!("stream {:?}: read queue back below low watermark", self.core.descriptor());
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("stream {:?}: recv failed: {}", self.core.descriptor(), err);
                    self.read_queue.shutdown(Error::from_io(err));
                    let _ = self.core.reactor.hide_readable(&self.core.entry);
                    self.readable_armed.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    pub fn shutdown(&self, direction: Direction) -> Result<()> {
        if *self.state.lock() == State::Opened {
            return Err(Error::Invalid("shutdown requires an open descriptor"));
        }
        self.core.mark_shutdown(direction, Initiator::Local);
        match direction {
            Direction::Send | Direction::Both => self.write_queue.shutdown(Error::Eof),
            Direction::Receive => {}
        }
        if matches!(direction, Direction::Receive | Direction::Both) {
            self.read_queue.shutdown(Error::Eof);
        }
        Ok(())
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

    pub fn write_queue(&self) -> &Arc<WriteQueue> {
        &self.write_queue
    }

    pub fn read_queue(&self) -> &Arc<ReadQueue> {
        &self.read_queue
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
    fn connect_refused_reports_error_on_callback() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let chronology = Arc::new(Chronology::new());

        // Bind a listener and immediately drop it to get a deterministic
        // ECONNREFUSED target.
        let probe = RawSocket::from_addr(loopback(), libc::SOCK_STREAM, 0).unwrap();
        probe.set_reuse_address().unwrap();
        probe.bind(loopback()).unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let stream = Arc::new(
            StreamSocket::open(loopback(), Arc::clone(&reactor), chronology, Default::default()).unwrap(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        stream
            .connect(Endpoint::from_socket_addr(addr), None, move |res| {
                if res.is_err() {
                    f.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        for _ in 0..50 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            reactor
                .poll(Some(Instant::now() + std::time::Duration::from_millis(50)))
                .unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
