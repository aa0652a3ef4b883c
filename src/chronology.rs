use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Options governing a single [`Timer`].
#[derive(Clone, Debug)]
pub struct TimerOptions {
    pub deadline: Instant,
    /// `Some(period)` reschedules the timer every time it fires.
    pub period: Option<Duration>,
}

impl TimerOptions {
    pub fn once(deadline: Instant) -> TimerOptions {
        TimerOptions {
            deadline,
            period: None,
        }
    }

    pub fn periodic(deadline: Instant, period: Duration) -> TimerOptions {
        TimerOptions {
            deadline,
            period: Some(period),
        }
    }
}

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerRecord {
    deadline: Instant,
    period: Option<Duration>,
    callback: Option<TimerCallback>,
    seq: u64,
    generation: u64,
    cancelled: bool,
}

/// A handle to a timer previously created by [`Chronology::create_timer`].
///
/// Carries a generation counter so that a cancelled-then-recycled heap slot
/// can never be mistaken for the timer the handle originally named.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TimerHandle {
    id: u64,
    generation: u64,
}

struct HeapItem {
    deadline: Instant,
    seq: u64,
    id: u64,
}

impl Eq for HeapItem {}
impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline (and,
        // among ties, the earliest insertion) to compare greatest so it
        // pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<HeapItem>,
    timers: std::collections::HashMap<u64, TimerRecord>,
    deferred: VecDeque<Box<dyn FnOnce() + Send>>,
    next_id: u64,
    next_seq: u64,
    parent: Option<Arc<Chronology>>,
}

/// Monotonic timer wheel and deferred-function queue.
///
/// Drained between poll iterations by a [`Driver`]'s waiter loop. A
/// per-driver Chronology may delegate to a shared interface-wide one by
/// naming it as `parent`: `earliest()` then reports the nearer of its own
/// heap and the parent's, so a single coarse interface timer can still wake
/// a driver-local loop promptly.
///
/// [`Driver`]: crate::driver::Driver
pub struct Chronology {
    inner: Mutex<Inner>,
    generation: AtomicU64,
}

impl Chronology {
    pub fn new() -> Chronology {
        Chronology {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                timers: std::collections::HashMap::new(),
                deferred: VecDeque::new(),
                next_id: 1,
                next_seq: 0,
                parent: None,
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Build a Chronology that consults `parent` when computing its own
    /// earliest deadline, per spec.md's hierarchical linkage.
    pub fn with_parent(parent: Arc<Chronology>) -> Chronology {
        let chronology = Chronology::new();
        chronology.inner.lock().parent = Some(parent);
        chronology
    }

    pub fn create_timer(
        &self,
        options: TimerOptions,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let generation = self.generation.fetch_add(1, AtomicOrdering::Relaxed);

        inner.heap.push(HeapItem {
            deadline: options.deadline,
            seq,
            id,
        });
        inner.timers.insert(
            id,
            TimerRecord {
                deadline: options.deadline,
                period: options.period,
                callback: Some(Box::new(callback)),
                seq,
                generation,
                cancelled: false,
            },
        );

        TimerHandle { id, generation }
    }

    /// Idempotent: cancelling an already-fired one-shot timer or an unknown
    /// handle is a silent no-op.
    pub fn cancel_timer(&self, handle: TimerHandle) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.timers.get_mut(&handle.id) {
            if record.generation == handle.generation {
                record.cancelled = true;
                record.callback = None;
            }
        }
    }

    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.lock().deferred.push_back(Box::new(f));
    }

    /// The nearer of this Chronology's own earliest deadline and its
    /// parent's, if any.
    pub fn earliest(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        let mine = inner
            .heap
            .peek()
            .map(|item| item.deadline)
            .filter(|_| !inner.timers.is_empty());
        let parent = inner.parent.as_ref().and_then(|p| p.earliest());
        match (mine, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Pop and invoke every timer whose deadline is `<= now`, then drain
    /// the deferred-function FIFO.
    ///
    /// When `permit_reentrant` is false, deferred work enqueued *during*
    /// this call is left for the next `announce` rather than drained
    /// immediately, bounding call-stack depth in single-threaded mode.
    pub fn announce(&self, now: Instant, permit_reentrant: bool) {
        self.announce_timers(now);
        self.drain_deferred(permit_reentrant);
    }

    pub fn announce_now(&self, permit_reentrant: bool) {
        self.announce(Instant::now(), permit_reentrant);
    }

    fn announce_timers(&self, now: Instant) {
        loop {
            let due = {
                let mut inner = self.inner.lock();
                match inner.heap.peek() {
                    Some(item) if item.deadline <= now => inner.heap.pop(),
                    _ => None,
                }
            };
            let Some(item) = due else { break };

            let mut callback = {
                let mut inner = self.inner.lock();
                let Some(record) = inner.timers.get_mut(&item.id) else {
                    continue;
                };
                if record.cancelled {
                    inner.timers.remove(&item.id);
                    continue;
                }
                if record.seq != item.seq {
                    // Stale heap entry from a superseded reschedule.
                    continue;
                }
                let callback = record.callback.take();
                if let Some(period) = record.period {
                    let next_deadline = record.deadline + period;
                    record.deadline = next_deadline;
                    inner.next_seq += 1;
                    record.seq = inner.next_seq;
                    inner.heap.push(HeapItem {
                        deadline: next_deadline,
                        seq: record.seq,
                        id: item.id,
                    });
                } else {
                    inner.timers.remove(&item.id);
                }
                callback
            };

            if let Some(callback) = callback.as_mut() {
                callback();
            }
            if let Some(callback) = callback {
                // One-shot timers that rescheduled above already removed
                // their record; periodic ones need their callback put back.
                let mut inner = self.inner.lock();
                if let Some(record) = inner.timers.get_mut(&item.id) {
                    record.callback = Some(callback);
                }
            }
        }
    }

    fn drain_deferred(&self, permit_reentrant: bool) {
        if permit_reentrant {
            loop {
                let next = self.inner.lock().deferred.pop_front();
                let Some(f) = next else { break };
                f();
            }
            return;
        }

        // Snapshot what's queued right now; anything `defer`red by one of
        // these callbacks waits for the next `announce` instead of running
        // in this call, bounding recursion through `defer` -> `announce`.
        let mut inner = self.inner.lock();
        let batch: Vec<_> = inner.deferred.drain(..).collect();
        drop(inner);
        for f in batch {
            f();
        }
    }

    pub fn clear_timers(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        inner.timers.clear();
    }

    pub fn clear_deferred(&self) {
        self.inner.lock().deferred.clear();
    }

    pub fn clear_all(&self) {
        self.clear_timers();
        self.clear_deferred();
    }
}

impl Default for Chronology {
    fn default() -> Chronology {
        Chronology::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn timers_fire_in_deadline_then_insertion_order() {
        let chronology = Chronology::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now();

        for id in [1, 2, 3] {
            let order = Arc::clone(&order);
            let deadline = if id == 3 {
                base + Duration::from_millis(20)
            } else {
                base + Duration::from_millis(10)
            };
            chronology.create_timer(TimerOptions::once(deadline), move || {
                order.lock().push(id);
            });
        }

        chronology.announce(base + Duration::from_millis(15), true);
        assert_eq!(*order.lock(), vec![1, 2]);
        chronology.announce(base + Duration::from_millis(25), true);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_is_idempotent_and_suppresses_callback() {
        let chronology = Chronology::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = chronology.create_timer(
            TimerOptions::once(Instant::now()),
            move || {
                f.fetch_add(1, AtomicOrdering::SeqCst);
            },
        );
        chronology.cancel_timer(handle);
        chronology.cancel_timer(handle); // idempotent
        chronology.announce_now(true);
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn deferred_work_enqueued_non_reentrantly_waits_for_next_pass() {
        let chronology = Arc::new(Chronology::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_chronology = Arc::clone(&chronology);
        let inner_order = Arc::clone(&order);
        chronology.defer(move || {
            inner_order.lock().push(1);
            inner_chronology.defer(move || {
                // Enqueued during a non-reentrant announce: must not run
                // in this same pass.
            });
        });

        chronology.announce_now(false);
        assert_eq!(*order.lock(), vec![1]);
    }

    #[test]
    fn earliest_consults_parent() {
        let parent = Arc::new(Chronology::new());
        let base = Instant::now();
        parent.create_timer(TimerOptions::once(base + Duration::from_millis(5)), || {});

        let child = Chronology::with_parent(Arc::clone(&parent));
        child.create_timer(TimerOptions::once(base + Duration::from_millis(50)), || {});

        let earliest = child.earliest().unwrap();
        assert!(earliest <= base + Duration::from_millis(5) + Duration::from_millis(1));
    }
}
