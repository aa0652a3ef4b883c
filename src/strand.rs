use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type Posted = Box<dyn FnOnce() + Send>;

/// A logical, non-concurrent execution context (spec.md §5).
///
/// All user-visible callbacks for one socket fire serialized on its
/// strand. This crate has no bundled async runtime, so a strand is simply
/// a re-entrant-safe FIFO: posting from outside any currently-running
/// callback runs immediately on the caller's thread; posting from
/// *within* a running callback (the socket reentrantly touching itself)
/// queues behind it instead of recursing, so a deeply nested callback
/// chain can't blow the stack, and "reentrant invocation... must not
/// block" (spec.md §5) holds trivially since nothing ever parks.
pub struct Strand {
    queue: Mutex<VecDeque<Posted>>,
    running: AtomicBool,
}

impl Strand {
    pub fn new() -> Strand {
        Strand {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Run `f` on this strand, preserving per-strand FIFO order relative
    /// to any other `post` call already enqueued or in flight.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Box::new(f));
        self.drain_if_idle();
    }

    fn drain_if_idle(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another call (possibly this same call stack, reentrantly)
            // is already draining; it will pick up what we just pushed.
            return;
        }
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(job) => job(),
                None => break,
            }
        }
        self.running.store(false, Ordering::Release);
    }
}

impl Default for Strand {
    fn default() -> Strand {
        Strand::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn callbacks_run_in_post_order() {
        let strand = Strand::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            strand.post(move || order.lock().push(i));
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reentrant_post_does_not_recurse_or_block() {
        let strand = Arc::new(Strand::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&strand);
        let o = Arc::clone(&order);
        strand.post(move || {
            o.lock().push("outer-start");
            let o2 = Arc::clone(&o);
            s.post(move || o2.lock().push("inner"));
            o.lock().push("outer-end");
        });

        assert_eq!(*order.lock(), vec!["outer-start", "outer-end", "inner"]);
    }
}
