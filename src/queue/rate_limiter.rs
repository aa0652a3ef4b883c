use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Token-bucket limiter shared, optionally, by a queue's `drain`/fill
/// path. `rate` tokens (bytes) accrue per second up to `burst`.
pub struct RateLimiter {
    rate_per_sec: u64,
    burst: u64,
    state: Mutex<State>,
    denials: AtomicU64,
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u64, burst: u64) -> RateLimiter {
        RateLimiter {
            rate_per_sec,
            burst,
            state: Mutex::new(State {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            denials: AtomicU64::new(0),
        }
    }

    /// How many bytes, up to `requested`, may be spent right now. Updates
    /// the bucket as a side effect; 0 means the caller should wait.
    pub fn acquire(&self, requested: usize) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec as f64).min(self.burst as f64);
        state.last_refill = now;

        let grant = (requested as f64).min(state.tokens).floor().max(0.0) as usize;
        if grant == 0 && requested > 0 {
            self.denials.fetch_add(1, Ordering::Relaxed);
        }
        state.tokens -= grant as f64;
        grant
    }

    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_bounded_by_burst() {
        let limiter = RateLimiter::new(1_000, 10);
        assert_eq!(limiter.acquire(100), 10);
    }

    #[test]
    fn exhausted_bucket_denies_until_refill() {
        let limiter = RateLimiter::new(1_000_000, 5);
        assert_eq!(limiter.acquire(5), 5);
        assert_eq!(limiter.acquire(1), 0);
        assert!(limiter.denials() >= 1);
    }
}
