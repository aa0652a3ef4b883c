use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::{WatermarkEvent, WatermarkLatch, Watermarks};

pub type ReceiveCompletion = Box<dyn FnOnce(Result<(Vec<u8>, usize)>) + Send>;

/// A read-intent registered by a callback-form `receive` that couldn't be
/// satisfied synchronously: up to `max_len` bytes, completed once enough
/// data has been buffered or the queue shuts down.
struct ReadIntent {
    max_len: usize,
    deadline: Option<Instant>,
    token: Option<u64>,
    completion: ReceiveCompletion,
}

/// Ordered sequence of byte buffers dequeued from the socket receive
/// buffer; head = oldest. Filled by the Driver up to `highWatermark`,
/// drained either synchronously by `receive` or asynchronously against a
/// FIFO of [`ReadIntent`]s.
pub struct ReadQueue {
    watermarks: Watermarks,
    latch: Mutex<WatermarkLatch>,
    bytes: Mutex<VecDeque<u8>>,
    intents: Mutex<VecDeque<ReadIntent>>,
    total_size: AtomicUsize,
    receive_shutdown: AtomicBool,
}

impl ReadQueue {
    pub fn new(watermarks: Watermarks) -> ReadQueue {
        ReadQueue {
            watermarks,
            latch: Mutex::new(WatermarkLatch::new()),
            bytes: Mutex::new(VecDeque::new()),
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

    /// Appends bytes read from the socket's receive buffer. Called by the
    /// Driver, which stops filling once the queue reaches its high
    /// watermark. Returns the watermark event emitted, if any, and then
    /// satisfies any pending read-intents against the newly available
    /// bytes.
    pub fn fill(&self, data: &[u8]) -> Option<WatermarkEvent> {
        {
            let mut bytes = self.bytes.lock();
            bytes.extend(data.iter().copied());
        }
        self.total_size.fetch_add(data.len(), Ordering::AcqRel);
        let event = self
            .latch
            .lock()
            .observe(self.total_size(), self.watermarks, true);
        self.satisfy_intents();
        event
    }

    /// Synchronously returns up to `max_len` available bytes. Returns
    /// `WouldBlock` if nothing is buffered and the queue is not shut down,
    /// or `Eof` if shut down with nothing left.
    pub fn take(&self, max_len: usize) -> Result<(Vec<u8>, usize)> {
        let mut bytes = self.bytes.lock();
        if bytes.is_empty() {
            if self.receive_shutdown.load(Ordering::Acquire) {
                return Err(Error::Eof);
            }
            return Err(Error::WouldBlock);
        }
        let n = max_len.min(bytes.len());
        let out: Vec<u8> = bytes.drain(..n).collect();
        drop(bytes);
        self.total_size.fetch_sub(n, Ordering::AcqRel);
        let remaining = self.total_size();
        self.latch.lock().observe(remaining, self.watermarks, true);
        Ok((out, remaining))
    }

    /// Registers an asynchronous read-intent, to be satisfied once data
    /// arrives via `fill`, the deadline elapses, or the queue shuts down.
    pub fn register_intent(
        &self,
        max_len: usize,
        deadline: Option<Instant>,
        token: Option<u64>,
        completion: ReceiveCompletion,
    ) {
        self.intents.lock().push_back(ReadIntent {
            max_len,
            deadline,
            token,
            completion,
        });
        self.satisfy_intents();
    }

    fn satisfy_intents(&self) {
        loop {
            let ready = {
                let bytes = self.bytes.lock();
                let intents = self.intents.lock();
                !bytes.is_empty() && !intents.is_empty()
            };
            if !ready {
                break;
            }
            let intent = {
                let mut intents = self.intents.lock();
                intents.pop_front()
            };
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
        let drained: Vec<ReadIntent> = self.intents.lock().drain(..).collect();
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

    #[test]
    fn fill_then_take_round_trips_bytes() {
        let queue = ReadQueue::new(Watermarks::new(4, 8));
        queue.fill(b"hello");
        let (data, remaining) = queue.take(16).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(remaining, 0);
    }

    #[test]
    fn take_on_empty_queue_is_would_block_until_shutdown() {
        let queue = ReadQueue::new(Watermarks::new(4, 8));
        assert!(matches!(queue.take(4), Err(Error::WouldBlock)));
        queue.shutdown(Error::Eof);
        assert!(matches!(queue.take(4), Err(Error::Eof)));
    }

    #[test]
    fn high_watermark_then_low_alternate_on_fill_and_take() {
        let queue = ReadQueue::new(Watermarks::new(4, 8));
        assert_eq!(queue.fill(&[0u8; 8]), Some(WatermarkEvent::High));
        assert_eq!(queue.fill(&[0u8; 1]), None);
        let (_, remaining) = queue.take(6).unwrap();
        assert_eq!(remaining, 3);
    }

    #[test]
    fn registered_intent_is_satisfied_by_a_later_fill() {
        let queue = ReadQueue::new(Watermarks::new(4, 8));
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        queue.register_intent(
            16,
            None,
            None,
            Box::new(move |res| {
                *r.lock() = Some(res);
            }),
        );
        assert!(result.lock().is_none());
        queue.fill(b"hi");
        let got = result.lock().take().unwrap().unwrap();
        assert_eq!(got.0, b"hi");
    }

    #[test]
    fn cancel_removes_intent_and_reports_cancelled() {
        let queue = ReadQueue::new(Watermarks::new(4, 8));
        let fired = Arc::new(AU::new(0));
        let f = Arc::clone(&fired);
        queue.register_intent(
            16,
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
