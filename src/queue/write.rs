use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::rate_limiter::RateLimiter;
use super::{WatermarkEvent, WatermarkLatch, Watermarks};

pub type SendCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// Per-send knobs: `priority` breaks FIFO order (higher drains first,
/// ties FIFO), `deadline` bounds how long the entry may sit unsent,
/// `token` names it for later cancellation.
#[derive(Default)]
pub struct SendOptions {
    pub priority: u8,
    pub deadline: Option<Instant>,
    pub token: Option<u64>,
}

struct WriteEntry {
    payload: VecDeque<u8>,
    priority: u8,
    deadline: Option<Instant>,
    token: Option<u64>,
    completion: Option<SendCompletion>,
}

/// Ordered sequence of pending send operations with watermark-based
/// backpressure, grounded on spec.md §4.D's WriteQueue contract.
pub struct WriteQueue {
    watermarks: Watermarks,
    latch: Mutex<WatermarkLatch>,
    entries: Mutex<VecDeque<WriteEntry>>,
    total_size: AtomicUsize,
    send_shutdown: AtomicBool,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl WriteQueue {
    pub fn new(watermarks: Watermarks, rate_limiter: Option<Arc<RateLimiter>>) -> WriteQueue {
        WriteQueue {
            watermarks,
            latch: Mutex::new(WatermarkLatch::new()),
            entries: Mutex::new(VecDeque::new()),
            total_size: AtomicUsize::new(0),
            send_shutdown: AtomicBool::new(false),
            rate_limiter,
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
        self.send_shutdown.load(Ordering::Acquire)
    }

    /// Enqueues `data` (rejecting if it would push the queue strictly
    /// past the high watermark) and, if the kernel send buffer has room
    /// and no rate limiter defers it, drains immediately in the caller's
    /// thread via `try_write` before returning.
    pub fn send(
        &self,
        data: Vec<u8>,
        options: SendOptions,
        completion: Option<SendCompletion>,
        try_write: &mut dyn FnMut(&[u8]) -> Result<usize>,
    ) -> Result<()> {
        if self.send_shutdown.load(Ordering::Acquire) {
            if let Some(completion) = completion {
                completion(Err(Error::Eof));
            }
            return Err(Error::Eof);
        }

        let prospective = self.total_size.load(Ordering::Acquire) + data.len();
        if prospective > self.watermarks.high {
            return Err(Error::WouldBlock);
        }

        let entry = WriteEntry {
            payload: data.into(),
            priority: options.priority,
            deadline: options.deadline,
            token: options.token,
            completion,
        };
        self.insert_by_priority(entry);
        self.total_size.store(prospective, Ordering::Release);
        self.latch.lock().observe(prospective, self.watermarks, false);

        self.drain(usize::MAX, try_write);
        Ok(())
    }

    fn insert_by_priority(&self, entry: WriteEntry) {
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(entries.len());
        entries.insert(position, entry);
    }

    /// Copies queued payloads to the kernel send buffer in priority/FIFO
    /// order, honoring per-entry deadlines and the rate limiter, up to
    /// `budget` bytes. Returns the watermark event emitted, if any.
    pub fn drain(&self, budget: usize, try_write: &mut dyn FnMut(&[u8]) -> Result<usize>) -> Option<WatermarkEvent> {
        let mut spent = 0usize;
        let now = Instant::now();

        loop {
            if spent >= budget {
                break;
            }
            let mut entries = self.entries.lock();
            let Some(front) = entries.front_mut() else { break };

            if let Some(deadline) = front.deadline {
                if now >= deadline {
                    let mut expired = entries.pop_front().unwrap();
                    let removed = expired.payload.len();
                    drop(entries);
                    self.total_size.fetch_sub(removed, Ordering::AcqRel);
                    if let Some(completion) = expired.completion.take() {
                        completion(Err(Error::Timeout));
                    }
                    continue;
                }
            }

            let (chunk_vec, allowed) = {
                let available = front.payload.len();
                let allowed = match &self.rate_limiter {
                    Some(limiter) => limiter.acquire((budget - spent).min(available)),
                    None => available.min(budget - spent),
                };
                if allowed == 0 {
                    break;
                }
                (front.payload.iter().take(allowed).copied().collect::<Vec<u8>>(), allowed)
            };
            drop(entries);

            let written = match try_write(&chunk_vec) {
                Ok(n) => n,
                Err(Error::WouldBlock) => break,
                Err(err) => {
                    let mut entries = self.entries.lock();
                    if let Some(mut failed) = entries.pop_front() {
                        let removed = failed.payload.len();
                        drop(entries);
                        self.total_size.fetch_sub(removed, Ordering::AcqRel);
                        if let Some(completion) = failed.completion.take() {
                            completion(Err(err));
                        }
                    }
                    break;
                }
            };

            if written == 0 {
                break;
            }
            spent += written;

            let mut entries = self.entries.lock();
            if let Some(front) = entries.front_mut() {
                for _ in 0..written {
                    front.payload.pop_front();
                }
                let done = front.payload.is_empty();
                if done {
                    let mut finished = entries.pop_front().unwrap();
                    drop(entries);
                    self.total_size.fetch_sub(written.min(allowed), Ordering::AcqRel);
                    if let Some(completion) = finished.completion.take() {
                        completion(Ok(()));
                    }
                } else {
                    drop(entries);
                    self.total_size.fetch_sub(written, Ordering::AcqRel);
                }
            }

            if written < allowed {
                break;
            }
        }

        self.latch.lock().observe(self.total_size.load(Ordering::Acquire), self.watermarks, false)
    }

    /// Removes the entry tagged with `token`, if still pending, and
    /// completes it with `cancelled`.
    pub fn cancel(&self, token: u64) -> bool {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.token == Some(token)) {
            let mut entry = entries.remove(pos).unwrap();
            let removed = entry.payload.len();
            drop(entries);
            self.total_size.fetch_sub(removed, Ordering::AcqRel);
            self.latch.lock().observe(self.total_size.load(Ordering::Acquire), self.watermarks, false);
            if let Some(completion) = entry.completion.take() {
                completion(Err(Error::Cancelled));
            }
            true
        } else {
            false
        }
    }

    /// Fails every pending entry and marks the queue shut for send.
    pub fn shutdown(&self, reason: Error) {
        self.send_shutdown.store(true, Ordering::Release);
        let mut entries = self.entries.lock();
        let drained: Vec<WriteEntry> = entries.drain(..).collect();
        drop(entries);
        self.total_size.store(0, Ordering::Release);
        for mut entry in drained {
            if let Some(completion) = entry.completion.take() {
                completion(Err(clone_reason(&reason)));
            }
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

    #[test]
    fn send_beyond_high_watermark_is_rejected_without_enqueueing() {
        let queue = WriteQueue::new(Watermarks::new(4, 8), None);
        let mut sink = |_: &[u8]| -> Result<usize> { Ok(0) };
        queue.send(vec![0u8; 8], SendOptions::default(), None, &mut sink).unwrap();
        let err = queue
            .send(vec![0u8; 1], SendOptions::default(), None, &mut sink)
            .unwrap_err();
        assert!(matches!(err, Error::WouldBlock));
        assert!(queue.total_size() <= 8);
    }

    #[test]
    fn send_drains_immediately_when_sink_accepts_everything() {
        let queue = WriteQueue::new(Watermarks::new(4, 8), None);
        let mut written = Vec::new();
        let mut sink = |chunk: &[u8]| -> Result<usize> {
            written.extend_from_slice(chunk);
            Ok(chunk.len())
        };
        queue.send(b"hello".to_vec(), SendOptions::default(), None, &mut sink).unwrap();
        assert_eq!(written, b"hello");
        assert_eq!(queue.total_size(), 0);
    }

    #[test]
    fn shutdown_fails_pending_sends_with_eof() {
        let queue = WriteQueue::new(Watermarks::new(4, 8), None);
        let mut sink = |_: &[u8]| -> Result<usize> { Err(Error::WouldBlock) };
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        queue
            .send(
                vec![0u8; 4],
                SendOptions::default(),
                Some(Box::new(move |res| {
                    if matches!(res, Err(Error::Eof)) {
                        f.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                &mut sink,
            )
            .unwrap();
        queue.shutdown(Error::Eof);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let err = queue
            .send(vec![0u8; 1], SendOptions::default(), None, &mut sink)
            .unwrap_err();
        assert!(matches!(err, Error::Eof));
    }
}
