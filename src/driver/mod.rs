//! Module C: the abstract I/O engine.
//!
//! Two variants share a family resemblance but not a single trait: the
//! Reactor exposes readiness (`showX`/`hideX`/`poll`) and the Proactor
//! exposes completion-style submission (`accept`/`connect`/`send`/
//! `receive`). Both are built over the same [`crate::sys::Selector`] and
//! [`crate::registry::Registry`], and both expose the waiter lifecycle:
//! `register_waiter`, `run`, `deregister_waiter`.

mod reactor;
mod proactor;

pub use self::proactor::{CompletionValue, Proactor};
pub use self::reactor::{Reactor, ReactorConfig};

use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by `register_waiter`, identifying the thread that will
/// call `run` with it. Exactly one thread per token (spec.md §4.C).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WaiterToken(u64);

pub(crate) struct WaiterTokenAllocator {
    next: AtomicU64,
}

impl WaiterTokenAllocator {
    pub(crate) fn new() -> WaiterTokenAllocator {
        WaiterTokenAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate(&self) -> WaiterToken {
        WaiterToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Token reserved for the driver's own waker registration; real
/// descriptors are keyed by their raw fd value, which epoll guarantees is
/// a small non-negative integer, so the top of the `u64` space is safe to
/// reserve.
pub(crate) const WAKER_TOKEN: u64 = u64::MAX;
