//! Module D: the three per-socket queue flavors and the watermark latch
//! they share.

mod accept;
mod datagram_read;
mod rate_limiter;
mod read;
mod write;

pub use self::accept::{AcceptCompletion, AcceptQueue};
pub use self::datagram_read::{DatagramReadQueue, DatagramReceiveCompletion};
pub use self::rate_limiter::RateLimiter;
pub use self::read::{ReadQueue, ReceiveCompletion};
pub use self::write::{SendCompletion, SendOptions, WriteQueue};

/// `(low, high)` thresholds shared by all three queue flavors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn new(low: usize, high: usize) -> Watermarks {
        Watermarks { low, high }
    }
}

/// A watermark crossing worth telling the socket about.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WatermarkEvent {
    High,
    Low,
}

/// Tracks the `lowWatermarkArmed` / `highWatermarkBreached` latch pair
/// from spec.md §3: a low-watermark event fires only after a prior
/// high-watermark event, and thereafter the two strictly alternate.
#[derive(Default)]
pub(crate) struct WatermarkLatch {
    high_breached: bool,
}

impl WatermarkLatch {
    pub(crate) fn new() -> WatermarkLatch {
        WatermarkLatch { high_breached: false }
    }

    pub(crate) fn is_high_breached(&self) -> bool {
        self.high_breached
    }

    /// Call after a size change that may have crossed a threshold.
    /// Returns the event to emit, if any.
    ///
    /// `inclusive_high` decides whether *reaching* `watermarks.high`
    /// counts as a breach (`>=`, used by ReadQueue/AcceptQueue, which are
    /// filled by the Driver and can legitimately land exactly on the
    /// threshold) or only *exceeding* it (`>`, used by WriteQueue, which
    /// rejects any send that would push size past `high` before it is
    /// ever enqueued, so landing exactly on `high` is a normal accepted
    /// send and must stay silent).
    pub(crate) fn observe(
        &mut self,
        size: usize,
        watermarks: Watermarks,
        inclusive_high: bool,
    ) -> Option<WatermarkEvent> {
        let breached = if inclusive_high {
            size >= watermarks.high
        } else {
            size > watermarks.high
        };
        if !self.high_breached && breached {
            self.high_breached = true;
            return Some(WatermarkEvent::High);
        }
        if self.high_breached && size <= watermarks.low {
            self.high_breached = false;
            return Some(WatermarkEvent::Low);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_does_not_fire_without_prior_high() {
        let mut latch = WatermarkLatch::new();
        let watermarks = Watermarks::new(4, 8);
        assert_eq!(latch.observe(2, watermarks, true), None);
        assert_eq!(latch.observe(0, watermarks, true), None);
    }

    #[test]
    fn high_then_low_alternate() {
        let mut latch = WatermarkLatch::new();
        let watermarks = Watermarks::new(4, 8);
        assert_eq!(latch.observe(9, watermarks, true), Some(WatermarkEvent::High));
        assert_eq!(latch.observe(6, watermarks, true), None);
        assert_eq!(latch.observe(3, watermarks, true), Some(WatermarkEvent::Low));
        assert_eq!(latch.observe(9, watermarks, true), Some(WatermarkEvent::High));
    }

    #[test]
    fn exclusive_high_does_not_breach_on_exact_match() {
        let mut latch = WatermarkLatch::new();
        let watermarks = Watermarks::new(4, 8);
        assert_eq!(latch.observe(8, watermarks, false), None);
        assert_eq!(latch.observe(9, watermarks, false), Some(WatermarkEvent::High));
    }

    #[test]
    fn inclusive_high_breaches_on_exact_match() {
        let mut latch = WatermarkLatch::new();
        let watermarks = Watermarks::new(4, 8);
        assert_eq!(latch.observe(8, watermarks, true), Some(WatermarkEvent::High));
    }
}
