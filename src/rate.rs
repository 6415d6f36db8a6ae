//! Token bucket rate limiter for bounding backend pressure.
//!
//! Garbage collection scans the whole ID range; without a limiter a large
//! range would hammer the backend with reads. The bucket refills `burst`
//! tokens every `refill_interval`.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Intra-process token bucket.
pub struct RateLimiter {
    refill_interval: Duration,
    burst: u32,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter refilling `burst` tokens every `refill_interval`.
    ///
    /// The bucket starts full.
    pub fn new(refill_interval: Duration, burst: u32) -> Self {
        Self {
            refill_interval,
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then consume it.
    pub async fn wait(&self) {
        loop {
            let sleep_for = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until one token is replenished.
                let per_token = self.refill_interval.as_secs_f64() / f64::from(self.burst);
                Duration::from_secs_f64(per_token * (1.0 - state.tokens))
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let replenished =
            elapsed.as_secs_f64() / self.refill_interval.as_secs_f64() * f64::from(self.burst);
        state.tokens = (state.tokens + replenished).min(f64::from(self.burst));
        state.last_refill = now;
    }
}
