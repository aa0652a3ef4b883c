use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::interests::{Interest, Trigger};

/// Number of shards the descriptor map is split across, bounding lock
/// contention under a worker-thread pool. A power of two so the shard
/// index is a cheap mask.
const SHARD_COUNT: usize = 16;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum EntryState {
    Attached,
    Detaching,
    Detached,
}

type EventCallback = Box<dyn FnMut() + Send>;
type DetachCallback = Box<dyn FnOnce() + Send>;

struct EntryInner {
    interest: Interest,
    trigger: Trigger,
    readable: Option<EventCallback>,
    writable: Option<EventCallback>,
    error: Option<EventCallback>,
    state: EntryState,
    detach_callback: Option<DetachCallback>,
}

/// One per attached descriptor.
///
/// Owns the descriptor's current `Interest`, its per-event callbacks, a
/// process counter tracking in-flight callback invocations, and the
/// `attached -> detaching -> detached` state machine. See spec.md §3 for
/// the invariants this type enforces.
pub struct RegistryEntry {
    descriptor: Descriptor,
    process_counter: AtomicUsize,
    inner: Mutex<EntryInner>,
}

impl RegistryEntry {
    fn new(descriptor: Descriptor) -> Arc<RegistryEntry> {
        Arc::new(RegistryEntry {
            descriptor,
            process_counter: AtomicUsize::new(0),
            inner: Mutex::new(EntryInner {
                interest: Interest::NONE,
                trigger: Trigger::LEVEL,
                readable: None,
                writable: None,
                error: None,
                state: EntryState::Attached,
                detach_callback: None,
            }),
        })
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn interest(&self) -> Interest {
        self.inner.lock().interest
    }

    pub fn trigger(&self) -> Trigger {
        self.inner.lock().trigger
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.inner.lock().state, EntryState::Attached)
    }

    fn is_lookupable(&self) -> bool {
        matches!(
            self.inner.lock().state,
            EntryState::Attached | EntryState::Detaching
        )
    }

    /// Set or clear the callback and interest bit for one event kind,
    /// returning the aggregate `Interest` so the driver can re-arm its
    /// kernel subscription.
    fn show(&self, bit: Interest, trigger: Trigger, callback: EventCallback) -> Interest {
        let mut inner = self.inner.lock();
        inner.interest |= bit;
        inner.trigger = trigger;
        set_slot(&mut inner, bit, Some(callback));
        inner.interest
    }

    fn hide(&self, bit: Interest) -> Interest {
        let mut inner = self.inner.lock();
        inner.interest = inner.interest.remove(bit);
        set_slot(&mut inner, bit, None);
        inner.interest
    }

    /// Invoke the current callback for `bit`, if any and if the entry is
    /// still attached or detaching. Returns `true` iff a callback ran. When
    /// the trigger is one-shot the interest bit is cleared atomically with
    /// the invocation; otherwise the callback is taken out, called without
    /// the lock held (it may reentrantly touch the registry), and put back
    /// unless something else already refilled or cleared the slot.
    fn announce(&self, bit: Interest) -> bool {
        let (mut callback, one_shot) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, EntryState::Attached | EntryState::Detaching) {
                return false;
            }
            let one_shot = inner.trigger.one_shot;
            let slot = match bit {
                Interest::READABLE => &mut inner.readable,
                Interest::WRITABLE => &mut inner.writable,
                Interest::ERROR => &mut inner.error,
                _ => return false,
            };
            let callback = match slot.take() {
                Some(callback) => callback,
                None => return false,
            };
            if one_shot {
                inner.interest = inner.interest.remove(bit);
            }
            (callback, one_shot)
        };

        callback();

        if !one_shot {
            let mut inner = self.inner.lock();
            let slot = match bit {
                Interest::READABLE => &mut inner.readable,
                Interest::WRITABLE => &mut inner.writable,
                Interest::ERROR => &mut inner.error,
                _ => unreachable!(),
            };
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
        true
    }
}

fn set_slot(inner: &mut EntryInner, bit: Interest, callback: Option<EventCallback>) {
    match bit {
        Interest::READABLE => inner.readable = callback,
        Interest::WRITABLE => inner.writable = callback,
        Interest::ERROR => inner.error = callback,
        _ => {}
    }
}

/// A guard held between `lookup_and_mark_processing_ongoing` and
/// `decrement_process_counter`, representing the logical reference that
/// prevents the entry's detach from completing while this thread is
/// dispatching an event to it.
pub struct ProcessingGuard {
    pub entry: Arc<RegistryEntry>,
}

/// Table of per-socket [`RegistryEntry`] values, sharded by descriptor to
/// bound lock contention.
pub struct Registry {
    shards: Vec<RwLock<HashMap<Descriptor, Arc<RegistryEntry>>>>,
    detach_epoch: AtomicU32,
}

impl Registry {
    pub fn new() -> Registry {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Registry {
            shards,
            detach_epoch: AtomicU32::new(0),
        }
    }

    fn shard(&self, descriptor: Descriptor) -> &RwLock<HashMap<Descriptor, Arc<RegistryEntry>>> {
        let idx = (descriptor.as_raw() as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn add(&self, descriptor: Descriptor) -> Result<Arc<RegistryEntry>> {
        let shard = self.shard(descriptor);
        let mut map = shard.write();
        if map.contains_key(&descriptor) {
            return Err(Error::Invalid("descriptor already registered"));
        }
        let entry = RegistryEntry::new(descriptor);
        map.insert(descriptor, Arc::clone(&entry));
        Ok(entry)
    }

    /// The sole means by which a driver thread obtains a reference to an
    /// entry during event announcement: finds the entry and atomically
    /// increments its process counter iff it is `attached` or `detaching`.
    pub fn lookup_and_mark_processing_ongoing(
        &self,
        descriptor: Descriptor,
    ) -> Option<ProcessingGuard> {
        let shard = self.shard(descriptor);
        let entry = shard.read().get(&descriptor).cloned()?;
        if !entry.is_lookupable() {
            return None;
        }
        entry.process_counter.fetch_add(1, Ordering::AcqRel);
        // Re-check after incrementing: a concurrent detach may have raced
        // us between the read above and the fetch_add.
        if !entry.is_lookupable() {
            entry.process_counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ProcessingGuard { entry })
    }

    pub fn show_readable(&self, entry: &Arc<RegistryEntry>, trigger: Trigger, callback: impl FnMut() + Send + 'static) -> Interest {
        entry.show(Interest::READABLE, trigger, Box::new(callback))
    }

    pub fn show_writable(&self, entry: &Arc<RegistryEntry>, trigger: Trigger, callback: impl FnMut() + Send + 'static) -> Interest {
        entry.show(Interest::WRITABLE, trigger, Box::new(callback))
    }

    pub fn show_error(&self, entry: &Arc<RegistryEntry>, trigger: Trigger, callback: impl FnMut() + Send + 'static) -> Interest {
        entry.show(Interest::ERROR, trigger, Box::new(callback))
    }

    pub fn hide_readable(&self, entry: &Arc<RegistryEntry>) -> Interest {
        entry.hide(Interest::READABLE)
    }

    pub fn hide_writable(&self, entry: &Arc<RegistryEntry>) -> Interest {
        entry.hide(Interest::WRITABLE)
    }

    pub fn hide_error(&self, entry: &Arc<RegistryEntry>) -> Interest {
        entry.hide(Interest::ERROR)
    }

    pub fn announce_readable(&self, entry: &Arc<RegistryEntry>) -> bool {
        entry.announce(Interest::READABLE)
    }

    pub fn announce_writable(&self, entry: &Arc<RegistryEntry>) -> bool {
        entry.announce(Interest::WRITABLE)
    }

    pub fn announce_error(&self, entry: &Arc<RegistryEntry>) -> bool {
        entry.announce(Interest::ERROR)
    }

    /// Transition the entry to `detaching`, install the detach callback,
    /// and run `deregister` to remove it from the kernel subscription. If
    /// the process counter is already zero, completes the detach
    /// immediately; otherwise the thread whose `decrement_process_counter`
    /// call drives the counter to zero completes it.
    pub fn remove_and_get_ready_to_detach(
        &self,
        descriptor: Descriptor,
        detach_callback: impl FnOnce() + Send + 'static,
        deregister: impl FnOnce(),
    ) -> Result<()> {
        let shard = self.shard(descriptor);
        let entry = {
            let map = shard.read();
            map.get(&descriptor)
                .cloned()
                .ok_or(Error::NotAuthorized)?
        };

        let should_announce_now = {
            let mut inner = entry.inner.lock();
            if inner.state == EntryState::Detached {
                return Ok(()); // idempotent
            }
            if inner.state == EntryState::Attached {
                inner.state = EntryState::Detaching;
            }
            inner.detach_callback = Some(Box::new(detach_callback));
            entry.process_counter.load(Ordering::Acquire) == 0
        };

        deregister();

        if should_announce_now {
            self.announce_detached_entry(&entry);
        }
        Ok(())
    }

    /// Paired with `lookup_and_mark_processing_ongoing`. Returns the
    /// remaining process-counter value; if it reaches zero and a detach is
    /// pending, completes the detach on this thread.
    pub fn decrement_process_counter(&self, guard: ProcessingGuard) -> usize {
        let remaining = guard.entry.process_counter.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            let pending = matches!(guard.entry.inner.lock().state, EntryState::Detaching);
            if pending {
                self.announce_detached_entry(&guard.entry);
            }
        }
        remaining
    }

    /// Transition `detaching -> detached` and invoke the detach callback
    /// exactly once. Returns `true` on the winning transition.
    fn announce_detached_entry(&self, entry: &Arc<RegistryEntry>) -> bool {
        let callback = {
            let mut inner = entry.inner.lock();
            if inner.state == EntryState::Detached {
                return false;
            }
            if entry.process_counter.load(Ordering::Acquire) != 0 {
                return false;
            }
            inner.state = EntryState::Detached;
            inner.readable = None;
            inner.writable = None;
            inner.error = None;
            inner.detach_callback.take()
        };

        self.detach_epoch.fetch_add(1, Ordering::AcqRel);
        {
            let shard = self.shard(entry.descriptor);
            shard.write().remove(&entry.descriptor);
        }

        if let Some(callback) = callback {
            callback();
        }
        true
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as AU;

    fn fd(n: u64) -> Descriptor {
        Descriptor::from_raw(n)
    }

    #[test]
    fn add_twice_is_rejected() {
        let registry = Registry::new();
        registry.add(fd(1)).unwrap();
        assert!(registry.add(fd(1)).is_err());
    }

    #[test]
    fn lookup_fails_once_detached() {
        let registry = Registry::new();
        registry.add(fd(2)).unwrap();
        registry
            .remove_and_get_ready_to_detach(fd(2), || {}, || {})
            .unwrap();
        assert!(registry.lookup_and_mark_processing_ongoing(fd(2)).is_none());
    }

    #[test]
    fn detach_waits_for_in_flight_processing() {
        let registry = Arc::new(Registry::new());
        registry.add(fd(3)).unwrap();
        let guard = registry.lookup_and_mark_processing_ongoing(fd(3)).unwrap();

        let detached = Arc::new(AU::new(0));
        let d = Arc::clone(&detached);
        registry
            .remove_and_get_ready_to_detach(fd(3), move || { d.fetch_add(1, Ordering::SeqCst); }, || {})
            .unwrap();
        // Still in flight: detach must not have completed yet.
        assert_eq!(detached.load(Ordering::SeqCst), 0);

        registry.decrement_process_counter(guard);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_callbacks_fire_after_detach_completes() {
        let registry = Registry::new();
        let entry = registry.add(fd(4)).unwrap();
        let fired = Arc::new(AU::new(0));
        let f = Arc::clone(&fired);
        registry.show_readable(&entry, Trigger::LEVEL, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        registry
            .remove_and_get_ready_to_detach(fd(4), || {}, || {})
            .unwrap();
        assert!(!registry.announce_readable(&entry));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_shot_clears_interest_on_announce() {
        let registry = Registry::new();
        let entry = registry.add(fd(5)).unwrap();
        registry.show_readable(&entry, Trigger::LEVEL.one_shot(), || {});
        assert!(entry.interest().is_readable());
        assert!(registry.announce_readable(&entry));
        assert!(!entry.interest().is_readable());
    }

    #[test]
    fn duplicate_detach_is_idempotent() {
        let registry = Registry::new();
        registry.add(fd(6)).unwrap();
        registry
            .remove_and_get_ready_to_detach(fd(6), || {}, || {})
            .unwrap();
        // Second call targets an already-removed descriptor.
        assert!(registry
            .remove_and_get_ready_to_detach(fd(6), || {}, || {})
            .is_err());
    }
}
