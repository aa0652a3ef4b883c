use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::interests::Trigger;

use super::reactor::{Reactor, ReactorConfig};

/// What a completed operation produced. A single value type covers all
/// four operation kinds so they can share one `PendingOp` shape and one
/// `Work` FIFO implementation.
#[derive(Debug)]
pub enum CompletionValue {
    Accepted(Descriptor),
    Connected,
    Transferred(usize),
}

type Attempt = Box<dyn FnMut() -> Result<CompletionValue> + Send>;
type Completion = Box<dyn FnOnce(Result<CompletionValue>) + Send>;

struct PendingOp {
    id: u64,
    attempt: Attempt,
    completion: Completion,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Work {
    accept: VecDeque<PendingOp>,
    connect: VecDeque<PendingOp>,
    send: VecDeque<PendingOp>,
    receive: VecDeque<PendingOp>,
}

impl Work {
    fn is_empty(&self) -> bool {
        self.accept.is_empty() && self.connect.is_empty() && self.send.is_empty() && self.receive.is_empty()
    }
}

enum Kind {
    Accept,
    Connect,
    Send,
    Receive,
}

/// Completion-style [`Driver`] variant layered over the same readiness
/// selector as [`Reactor`].
///
/// This is an emulation, not a native completion port: Linux has no
/// IOCP-equivalent for general sockets, so readiness from epoll is used
/// to decide *when to retry* a caller-supplied attempt closure, and the
/// attempt's own result (`Ok` or `Error::WouldBlock`) decides whether the
/// operation is actually done. monoio's `LegacyDriver` and compio's
/// `IoUringDriver`/poll-driver split follow the same shape: a uniform
/// submission surface over a readiness backend where true completion
/// ports aren't available. See `other_examples/` for the reference
/// patterns this is grounded on.
///
/// [`Driver`]: crate::driver
pub struct Proactor {
    reactor: Arc<Reactor>,
    work: Mutex<HashMap<Descriptor, Work>>,
    next_op_id: AtomicU64,
}

impl Proactor {
    pub fn new(config: ReactorConfig) -> Result<Arc<Proactor>> {
        Ok(Arc::new(Proactor {
            reactor: Reactor::new(config)?,
            work: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(1),
        }))
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn attach(&self, descriptor: Descriptor) -> Result<()> {
        self.reactor.attach(descriptor)?;
        self.work.lock().insert(descriptor, Work::default());
        Ok(())
    }

    pub fn accept(
        self: &Arc<Self>,
        descriptor: Descriptor,
        attempt: impl FnMut() -> Result<CompletionValue> + Send + 'static,
        completion: impl FnOnce(Result<CompletionValue>) + Send + 'static,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        self.submit(descriptor, Kind::Accept, attempt, completion, deadline)
    }

    pub fn connect(
        self: &Arc<Self>,
        descriptor: Descriptor,
        attempt: impl FnMut() -> Result<CompletionValue> + Send + 'static,
        completion: impl FnOnce(Result<CompletionValue>) + Send + 'static,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        self.submit(descriptor, Kind::Connect, attempt, completion, deadline)
    }

    pub fn send(
        self: &Arc<Self>,
        descriptor: Descriptor,
        attempt: impl FnMut() -> Result<CompletionValue> + Send + 'static,
        completion: impl FnOnce(Result<CompletionValue>) + Send + 'static,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        self.submit(descriptor, Kind::Send, attempt, completion, deadline)
    }

    pub fn receive(
        self: &Arc<Self>,
        descriptor: Descriptor,
        attempt: impl FnMut() -> Result<CompletionValue> + Send + 'static,
        completion: impl FnOnce(Result<CompletionValue>) + Send + 'static,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        self.submit(descriptor, Kind::Receive, attempt, completion, deadline)
    }

    fn submit(
        self: &Arc<Self>,
        descriptor: Descriptor,
        kind: Kind,
        attempt: impl FnMut() -> Result<CompletionValue> + Send + 'static,
        completion: impl FnOnce(Result<CompletionValue>) + Send + 'static,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let op = PendingOp {
            id,
            attempt: Box::new(attempt),
            completion: Box::new(completion),
            deadline,
        };

        let is_read_side = matches!(kind, Kind::Accept | Kind::Receive);
        {
            let mut work = self.work.lock();
            let entry = work.entry(descriptor).or_default();
            match kind {
                Kind::Accept => entry.accept.push_back(op),
                Kind::Connect => entry.connect.push_back(op),
                Kind::Send => entry.send.push_back(op),
                Kind::Receive => entry.receive.push_back(op),
            }
        }

        self.arm(descriptor, is_read_side)?;
        Ok(id)
    }

    /// Arm readable or writable interest for `descriptor` so the next
    /// kernel readiness notification drains its queue. Idempotent: safe
    /// to call when the interest is already shown. The callback holds
    /// only a `Weak` reference so a `Proactor` dropped mid-flight doesn't
    /// leak through its own registered callbacks.
    fn arm(self: &Arc<Self>, descriptor: Descriptor, readable: bool) -> Result<()> {
        let entry = match self.reactor.registry().lookup_and_mark_processing_ongoing(descriptor) {
            Some(guard) => {
                let entry = Arc::clone(&guard.entry);
                self.reactor.registry().decrement_process_counter(guard);
                entry
            }
            None => return Err(Error::NotAuthorized),
        };

        let weak: Weak<Proactor> = Arc::downgrade(self);
        if readable {
            if !entry.interest().is_readable() {
                let weak = weak.clone();
                self.reactor.show_readable(&entry, Trigger::LEVEL, move || {
                    if let Some(proactor) = weak.upgrade() {
                        proactor.drain_read_side(descriptor);
                    }
                })?;
            }
        } else if !entry.interest().is_writable() {
            self.reactor.show_writable(&entry, Trigger::LEVEL, move || {
                if let Some(proactor) = weak.upgrade() {
                    proactor.drain_write_side(descriptor);
                }
            })?;
        }
        Ok(())
    }

    fn drain_read_side(&self, descriptor: Descriptor) {
        self.drain_queue(descriptor, true);
    }

    fn drain_write_side(&self, descriptor: Descriptor) {
        self.drain_queue(descriptor, false);
    }

    /// Dequeue-attempt-callback loop for one side of one descriptor's
    /// `Work`. Stops at the first operation whose attempt still reports
    /// `would-block`; hides the interest once both relevant queues on
    /// this side are drained.
    fn drain_queue(&self, descriptor: Descriptor, read_side: bool) {
        loop {
            let mut op = {
                let mut work = self.work.lock();
                let Some(entry) = work.get_mut(&descriptor) else { return };
                let queue = if read_side { &mut entry.accept } else { &mut entry.connect };
                let secondary = if read_side { &mut entry.receive } else { &mut entry.send };
                match queue.pop_front().or_else(|| secondary.pop_front()) {
                    Some(op) => op,
                    None => {
                        drop(work);
                        let _ = self.hide_if_drained(descriptor, read_side);
                        return;
                    }
                }
            };

            if let Some(deadline) = op.deadline {
                if Instant::now() >= deadline {
                    (op.completion)(Err(Error::Timeout));
                    continue;
                }
            }

            match (op.attempt)() {
                Ok(value) => (op.completion)(Ok(value)),
                Err(Error::WouldBlock) => {
                    self.requeue_front(descriptor, read_side, op);
                    return;
                }
                Err(err) => (op.completion)(Err(err)),
            }
        }
    }

    fn requeue_front(&self, descriptor: Descriptor, read_side: bool, op: PendingOp) {
        let mut work = self.work.lock();
        if let Some(entry) = work.get_mut(&descriptor) {
            let queue = if read_side { &mut entry.accept } else { &mut entry.connect };
            queue.push_front(op);
        }
    }

    fn hide_if_drained(&self, descriptor: Descriptor, read_side: bool) -> Result<()> {
        let drained = self
            .work
            .lock()
            .get(&descriptor)
            .map(|entry| {
                if read_side {
                    entry.accept.is_empty() && entry.receive.is_empty()
                } else {
                    entry.connect.is_empty() && entry.send.is_empty()
                }
            })
            .unwrap_or(true);
        if !drained {
            return Ok(());
        }
        if let Some(guard) = self.reactor.registry().lookup_and_mark_processing_ongoing(descriptor) {
            let entry = Arc::clone(&guard.entry);
            self.reactor.registry().decrement_process_counter(guard);
            if read_side {
                self.reactor.hide_readable(&entry)?;
            } else {
                self.reactor.hide_writable(&entry)?;
            }
        }
        Ok(())
    }

    /// Cancel a pending operation by id, invoking its completion with
    /// `Cancelled`. A no-op if the id is unknown (already completed).
    pub fn cancel(&self, descriptor: Descriptor, id: u64) -> bool {
        let mut work = self.work.lock();
        let Some(entry) = work.get_mut(&descriptor) else { return false };
        for queue in [&mut entry.accept, &mut entry.connect, &mut entry.send, &mut entry.receive] {
            if let Some(pos) = queue.iter().position(|op| op.id == id) {
                let op = queue.remove(pos).unwrap();
                drop(work);
                (op.completion)(Err(Error::Cancelled));
                return true;
            }
        }
        false
    }

    /// Cancel every pending operation for `descriptor` with the given
    /// error, used by the socket close protocol.
    pub fn shutdown(&self, descriptor: Descriptor, reason: Error) {
        let drained = {
            let mut work = self.work.lock();
            work.remove(&descriptor)
        };
        let Some(mut drained) = drained else { return };
        for queue in [
            &mut drained.accept,
            &mut drained.connect,
            &mut drained.send,
            &mut drained.receive,
        ] {
            while let Some(op) = queue.pop_front() {
                (op.completion)(Err(shutdown_reason(&reason)));
            }
        }
    }
}

fn shutdown_reason(reason: &Error) -> Error {
    match reason {
        Error::Cancelled => Error::Cancelled,
        _ => Error::Eof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::sync::atomic::AtomicUsize as AU;

    fn make_pipe() -> (Descriptor, std::fs::File, std::fs::File) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let read_end = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let write_end = unsafe { std::fs::File::from_raw_fd(fds[1]) };
        (Descriptor::from_raw_fd(read_end.as_raw_fd()), read_end, write_end)
    }

    #[test]
    fn receive_completes_once_data_is_available() {
        let proactor = Proactor::new(ReactorConfig::default()).unwrap();
        let (descriptor, mut read_end, mut write_end) = make_pipe();
        proactor.attach(descriptor).unwrap();

        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        proactor
            .receive(
                descriptor,
                move || {
                    use std::io::Read;
                    let mut buf = [0u8; 8];
                    match read_end.read(&mut buf) {
                        Ok(0) => Err(Error::Eof),
                        Ok(n) => Ok(CompletionValue::Transferred(n)),
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
                        Err(e) => Err(Error::from_io(e)),
                    }
                },
                move |res| {
                    *r.lock() = Some(res);
                },
                None,
            )
            .unwrap();

        use std::io::Write;
        write_end.write_all(b"hi").unwrap();

        let n = proactor.reactor.poll(Some(Instant::now() + std::time::Duration::from_millis(200))).unwrap();
        assert_eq!(n, 1);
        let completed = result.lock().take().unwrap();
        match completed {
            Ok(CompletionValue::Transferred(n)) => assert_eq!(n, 2),
            other => panic!("unexpected completion: {:?}", other.is_ok()),
        }
    }

    #[test]
    fn cancel_invokes_completion_with_cancelled() {
        let proactor = Proactor::new(ReactorConfig::default()).unwrap();
        let (descriptor, read_end, _write_end) = make_pipe();
        proactor.attach(descriptor).unwrap();

        let fired = Arc::new(AU::new(0));
        let f = Arc::clone(&fired);
        let id = proactor
            .receive(
                descriptor,
                || Err(Error::WouldBlock),
                move |res| {
                    if matches!(res, Err(Error::Cancelled)) {
                        f.fetch_add(1, Ordering::SeqCst);
                    }
                },
                None,
            )
            .unwrap();

        assert!(proactor.cancel(descriptor, id));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(read_end);
    }
}
