use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::{WatermarkEvent, WatermarkLatch, Watermarks};

pub type DatagramReceiveCompletion = Box<dyn FnOnce(Result<(Vec<u8>, Option<SocketAddr>)>) + Send>;

struct DatagramMessage {
    data: Vec<u8>,
    source: Option<SocketAddr>,
}

struct DatagramIntent {
    max_len: usize,
    deadline: Option<Instant>,
    token: Option<u64>,
    completion: DatagramReceiveCompletion,
}

/// Ordered sequence of received datagrams, each carrying its own sender
/// address. Unlike [`ReadQueue`](super::ReadQueue)'s flat byte sequence,
/// entries here are never merged: a connectionless socket must preserve
/// per-datagram framing and the sender's endpoint for a synchronously- or
/// asynchronously-satisfied `receive` alike, per spec.md §8 S1.
pub struct DatagramReadQueue {
    watermarks: Watermarks,
    latch: Mutex<WatermarkLatch>,
    messages: Mutex<VecDeque<DatagramMessage>>,
    intents: Mutex<VecDeque<DatagramIntent>>,
    total_size: AtomicUsize,
    receive_shutdown: AtomicBool,
}

impl DatagramReadQueue {
    pub fn new(watermarks: Watermarks) -> DatagramReadQueue {
        DatagramReadQueue {
            watermarks,
            latch: Mutex::new(WatermarkLatch::new()),
            messages: Mutex::new(VecDeque::new()),
            intents: Mutex::new(VecDeque::new()),
            total_size: AtomicUsize::new(0),
            receive_shutdown: AtomicBool::new(false),
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn low_watermark(&self) -> usize {
        self.watermarks.low
    }

    pub fn high_watermark(&self) -> usize {
        self.watermarks.high
    }

    pub fn is_shutdown(&self) -> bool {
        self.receive_shutdown.load(Ordering::Acquire)
    }

    pub fn is_at_high_watermark(&self) -> bool {
        self.total_size() >= self.watermarks.high
    }

    /// Appends one received datagram with its sender address. Called by
    /// the Driver once per `recvfrom`, which is why the boundary `fill`'s
    /// flat byte-queue counterpart loses is preserved here.
    pub fn push(&self, data: Vec<u8>, source: Option<SocketAddr>) -> Option<WatermarkEvent> {
        let len = data.len();
        self.messages.lock().push_back(DatagramMessage { data, source });
        self.total_size.fetch_add(len, Ordering::AcqRel);
        let event = self
            .latch
            .lock()
            .observe(self.total_size(), self.watermarks, true);
        self.satisfy_intents();
        event
    }

    /// Synchronously dequeues the oldest datagram, truncated to `max_len`
    /// bytes: a short receive buffer truncates a datagram the way a short
    /// `recvfrom(2)` buffer does, discarding the remainder rather than
    /// leaving it for the next call.
    pub fn take(&self, max_len: usize) -> Result<(Vec<u8>, Option<SocketAddr>)> {
        let message = {
            let mut messages = self.messages.lock();
            match messages.pop_front() {
                Some(message) => message,
                None if self.receive_shutdown.load(Ordering::Acquire) => return Err(Error::Eof),
                None => return Err(Error::WouldBlock),
            }
        };
        self.total_size.fetch_sub(message.data.len(), Ordering::AcqRel);
        self.latch
            .lock()
            .observe(self.total_size(), self.watermarks, true);
        let DatagramMessage { mut data, source } = message;
        data.truncate(max_len);
        Ok((data, source))
    }

    /// Registers an asynchronous read-intent, to be satisfied once a
    /// datagram arrives via `push`, the deadline elapses, or the queue
    /// shuts down.
    pub fn register_intent(
        &self,
        max_len: usize,
        deadline: Option<Instant>,
        token: Option<u64>,
        completion: DatagramReceiveCompletion,
    ) {
        self.intents.lock().push_back(DatagramIntent {
            max_len,
            deadline,
            token,
            completion,
        });
        self.satisfy_intents();
    }

    fn satisfy_intents(&self) {
        loop {
            let ready = !self.messages.lock().is_empty() && !self.intents.lock().is_empty();
            if !ready {
                break;
            }
            let intent = self.intents.lock().pop_front();
            let Some(intent) = intent else { break };
            match self.take(intent.max_len) {
                Ok(result) => (intent.completion)(Ok(result)),
                Err(err) => (intent.completion)(Err(err)),
            }
        }
    }

    /// Matching by token, atomically removes a pending intent and
    /// completes it with `Cancelled`.
    pub fn cancel(&self, token: u64) -> bool {
        let intent = {
            let mut intents = self.intents.lock();
            intents
                .iter()
                .position(|i| i.token == Some(token))
                .map(|pos| intents.remove(pos).unwrap())
        };
        match intent {
            Some(intent) => {
                (intent.completion)(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Expires any intents whose deadline has elapsed, completing them
    /// with `Timeout`.
    pub fn expire(&self, now: Instant) {
        loop {
            let expired = {
                let mut intents = self.intents.lock();
                let pos = intents
                    .iter()
                    .position(|i| i.deadline.is_some_and(|d| now >= d));
                pos.map(|pos| intents.remove(pos).unwrap())
            };
            match expired {
                Some(intent) => (intent.completion)(Err(Error::Timeout)),
                None => break,
            }
        }
    }

    /// Marks the queue shut for receive and fails every pending intent
    /// with `reason`.
    pub fn shutdown(&self, reason: Error) {
        self.receive_shutdown.store(true, Ordering::Release);
        let drained: Vec<DatagramIntent> = self.intents.lock().drain(..).collect();
        for intent in drained {
            (intent.completion)(Err(clone_reason(&reason)));
        }
    }
}

fn clone_reason(reason: &Error) -> Error {
    match reason {
        Error::Cancelled => Error::Cancelled,
        Error::Timeout => Error::Timeout,
        _ => Error::Eof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as AU;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn push_then_take_preserves_source() {
        let queue = DatagramReadQueue::new(Watermarks::new(1, 8));
        queue.push(b"hi".to_vec(), Some(addr(4242)));
        let (data, source) = queue.take(64).unwrap();
        assert_eq!(data, b"hi");
        assert_eq!(source, Some(addr(4242)));
    }

    #[test]
    fn take_truncates_without_merging_the_next_message() {
        let queue = DatagramReadQueue::new(Watermarks::new(1, 8));
        queue.push(b"hello".to_vec(), Some(addr(1)));
        queue.push(b"world".to_vec(), Some(addr(2)));
        let (first, from_first) = queue.take(2).unwrap();
        assert_eq!(first, b"he");
        assert_eq!(from_first, Some(addr(1)));
        let (second, from_second) = queue.take(64).unwrap();
        assert_eq!(second, b"world");
        assert_eq!(from_second, Some(addr(2)));
    }

    #[test]
    fn registered_intent_receives_source_from_a_later_push() {
        let queue = DatagramReadQueue::new(Watermarks::new(1, 8));
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        queue.register_intent(
            64,
            None,
            None,
            Box::new(move |res| {
                *r.lock() = Some(res);
            }),
        );
        assert!(result.lock().is_none());
        queue.push(b"hi".to_vec(), Some(addr(9)));
        let (data, source) = result.lock().take().unwrap().unwrap();
        assert_eq!(data, b"hi");
        assert_eq!(source, Some(addr(9)));
    }

    #[test]
    fn cancel_removes_intent_and_reports_cancelled() {
        let queue = DatagramReadQueue::new(Watermarks::new(1, 8));
        let fired = Arc::new(AU::new(0));
        let f = Arc::clone(&fired);
        queue.register_intent(
            64,
            None,
            Some(1),
            Box::new(move |res| {
                if matches!(res, Err(Error::Cancelled)) {
                    f.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        assert!(queue.cancel(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
