use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

use super::{WatermarkEvent, WatermarkLatch, Watermarks};

pub type AcceptCompletion = Box<dyn FnOnce(Result<Descriptor>) + Send>;

struct AcceptIntent {
    deadline: Option<Instant>,
    token: Option<u64>,
    completion: AcceptCompletion,
}

/// Holds accepted-but-undelivered child descriptors. Receive-side flow
/// control is expressed by the listener showing/hiding readable interest
/// rather than by the queue itself throttling; this queue only buffers
/// the children and the accept-intent FIFO waiting on them, draining one
/// at a time, per spec.md §4.D.
pub struct AcceptQueue {
    watermarks: Watermarks,
    latch: Mutex<WatermarkLatch>,
    children: Mutex<VecDeque<Descriptor>>,
    intents: Mutex<VecDeque<AcceptIntent>>,
    total_size: AtomicUsize,
    shutdown: AtomicBool,
}

impl AcceptQueue {
    pub fn new(watermarks: Watermarks) -> AcceptQueue {
        AcceptQueue {
            watermarks,
            latch: Mutex::new(WatermarkLatch::new()),
            children: Mutex::new(VecDeque::new()),
            intents: Mutex::new(VecDeque::new()),
            total_size: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
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

    pub fn is_at_high_watermark(&self) -> bool {
        self.total_size() >= self.watermarks.high
    }

    /// Called by the Driver when `accept(2)` yields a new child
    /// descriptor. Returns the watermark event emitted, if any.
    pub fn push(&self, child: Descriptor) -> Option<WatermarkEvent> {
        self.children.lock().push_back(child);
        self.total_size.fetch_add(1, Ordering::AcqRel);
        let event = self
            .latch
            .lock()
            .observe(self.total_size(), self.watermarks, true);
        self.satisfy_intents();
        event
    }

    /// Synchronously dequeues one accepted child, if any is ready.
    pub fn take(&self) -> Result<Descriptor> {
        let mut children = self.children.lock();
        match children.pop_front() {
            Some(child) => {
                drop(children);
                self.total_size.fetch_sub(1, Ordering::AcqRel);
                self.latch
                    .lock()
                    .observe(self.total_size(), self.watermarks, true);
                Ok(child)
            }
            None if self.shutdown.load(Ordering::Acquire) => Err(Error::Eof),
            None => Err(Error::WouldBlock),
        }
    }

    pub fn register_intent(
        &self,
        deadline: Option<Instant>,
        token: Option<u64>,
        completion: AcceptCompletion,
    ) {
        self.intents.lock().push_back(AcceptIntent {
            deadline,
            token,
            completion,
        });
        self.satisfy_intents();
    }

    fn satisfy_intents(&self) {
        loop {
            let ready = !self.children.lock().is_empty() && !self.intents.lock().is_empty();
            if !ready {
                break;
            }
            let intent = self.intents.lock().pop_front();
            let Some(intent) = intent else { break };
            match self.take() {
                Ok(child) => (intent.completion)(Ok(child)),
                Err(err) => (intent.completion)(Err(err)),
            }
        }
    }

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

    /// Fails every pending accept-intent; any still-buffered, never
    /// delivered child descriptors are returned to the caller for closing
    /// (the queue itself owns no OS resources).
    pub fn shutdown(&self, reason: Error) -> Vec<Descriptor> {
        self.shutdown.store(true, Ordering::Release);
        let drained_intents: Vec<AcceptIntent> = self.intents.lock().drain(..).collect();
        for intent in drained_intents {
            (intent.completion)(Err(clone_reason(&reason)));
        }
        let remaining: Vec<Descriptor> = self.children.lock().drain(..).collect();
        self.total_size.store(0, Ordering::Release);
        remaining
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

    fn fd(n: u64) -> Descriptor {
        Descriptor::from_raw(n)
    }

    #[test]
    fn push_then_take_round_trips_child() {
        let queue = AcceptQueue::new(Watermarks::new(1, 4));
        queue.push(fd(7));
        assert_eq!(queue.take().unwrap(), fd(7));
    }

    #[test]
    fn take_on_empty_queue_is_would_block() {
        let queue = AcceptQueue::new(Watermarks::new(1, 4));
        assert!(matches!(queue.take(), Err(Error::WouldBlock)));
    }

    #[test]
    fn two_accepts_then_shutdown_delivers_no_third() {
        let queue = AcceptQueue::new(Watermarks::new(1, 4));
        queue.push(fd(1));
        queue.push(fd(2));
        assert_eq!(queue.take().unwrap(), fd(1));
        assert_eq!(queue.take().unwrap(), fd(2));
        let leftover = queue.shutdown(Error::Eof);
        assert!(leftover.is_empty());
        assert!(matches!(queue.take(), Err(Error::Eof)));
    }
}
