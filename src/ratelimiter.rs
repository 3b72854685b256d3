//! Token-bucket rate limiter.
//!
//! Tokens accumulate continuously; `try_acquire` deducts immediately or
//! reports when the next token becomes available. The absolute-time
//! bookkeeping (`next_available` rather than a per-call relative sleep) is
//! the same drift-avoidance technique `worker::run_worker` used for its
//! ad-hoc per-cycle pacing, generalized here into a reusable primitive with
//! an actual `rate`/`burst` contract.

use std::sync::Mutex;
use tokio::time::{self, Duration, Instant};

struct State {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    state: Mutex<State>,
}

impl TokenBucket {
    /// `rate == 0.0` disables pacing entirely (`try_acquire` always succeeds).
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            state: Mutex::new(State {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn with_default_burst(rate: f64) -> Self {
        Self::new(rate, (rate * 2.0).max(1.0))
    }

    fn refill(state: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(state.burst);
        state.last_refill = now;
    }

    /// Deducts `n` tokens if available. Returns `Ok(())` on success, or
    /// `Err(wait)` with the duration until enough tokens will exist.
    pub fn try_acquire(&self, n: f64) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        if state.rate <= 0.0 {
            return Ok(());
        }
        Self::refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            Ok(())
        } else {
            let deficit = n - state.tokens;
            Err(Duration::from_secs_f64(deficit / state.rate))
        }
    }

    /// Blocks the calling task until a token is available, then consumes it.
    pub async fn acquire_blocking(&self, n: f64) {
        loop {
            match self.try_acquire(n) {
                Ok(()) => return,
                Err(wait) => time::sleep_until(Instant::now() + wait).await,
            }
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.state.lock().unwrap().rate <= 0.0
    }

    /// Re-paces the bucket to a new rate, e.g. when a ramp-up stage
    /// transitions. Burst capacity is re-derived as `2 * rate` unless the
    /// caller passed an explicit burst at construction and never updates it
    /// here — callers that need a fixed burst should track it themselves.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state);
        state.rate = rate;
        state.burst = (rate * 2.0).max(1.0);
        state.tokens = state.tokens.min(state.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_rate_is_zero() {
        let bucket = TokenBucket::new(0.0, 0.0);
        assert!(bucket.is_unlimited());
        assert!(bucket.try_acquire(1_000.0).is_ok());
    }

    #[test]
    fn consumes_burst_then_blocks() {
        let bucket = TokenBucket::new(10.0, 2.0);
        assert!(bucket.try_acquire(1.0).is_ok());
        assert!(bucket.try_acquire(1.0).is_ok());
        assert!(bucket.try_acquire(1.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(10.0, 1.0);
        assert!(bucket.try_acquire(1.0).is_ok());
        assert!(bucket.try_acquire(1.0).is_err());
        time::advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire(1.0).is_ok());
    }

    #[test]
    fn default_burst_is_twice_rate() {
        let bucket = TokenBucket::with_default_burst(50.0);
        assert_eq!(bucket.state.lock().unwrap().burst, 100.0);
    }

    #[test]
    fn set_rate_reshapes_burst() {
        let bucket = TokenBucket::new(10.0, 20.0);
        bucket.set_rate(5.0);
        assert_eq!(bucket.state.lock().unwrap().rate, 5.0);
        assert_eq!(bucket.state.lock().unwrap().burst, 10.0);
    }
}
