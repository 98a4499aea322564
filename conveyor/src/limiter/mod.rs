//! Token-bucket rate limiting for stages that call the bounded
//! external dependency.
//!
//! A single limiter instance is shared by all pipeline executions; its
//! token counter is the only state mutated concurrently by unrelated
//! jobs. Refill is computed lazily from a monotonic clock at acquisition
//! time, so no background timer is needed.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A shared token bucket with fixed capacity and refill rate.
///
/// [`acquire`](RateLimiter::acquire) blocks until tokens are available;
/// requests beyond capacity wait rather than fail. Stages that do not
/// touch the bounded dependency simply skip the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Creates a limiter with `capacity` tokens refilled at
    /// `refill_per_sec` tokens per second. The bucket starts full.
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The configured capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        state.last_refill = now;
    }

    /// Takes `cost` tokens if available without blocking.
    ///
    /// Cost is clamped to capacity so a misconfigured caller cannot
    /// create a request that never succeeds.
    #[must_use]
    pub fn try_acquire(&self, cost: u32) -> bool {
        let cost = f64::from(cost).min(self.capacity);
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Blocks until `cost` tokens are available and takes them.
    ///
    /// The wait between attempts is computed from the current deficit,
    /// so callers sleep roughly exactly as long as the refill requires.
    pub async fn acquire(&self, cost: u32) {
        let cost = f64::from(cost).min(self.capacity);
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                if state.tokens >= cost {
                    state.tokens -= cost;
                    return;
                }
                let deficit = cost - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };

            trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }
}
