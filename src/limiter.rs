//! Token-bucket rate limiting with minimum inter-request pacing.
//!
//! Used at two scopes: one global limiter consulted before every
//! realtime-mode probe, and one per-check limiter created when a check
//! declares `rate_limit_per_minute > 0`.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const REFILL_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct LimiterState {
    tokens: u32,
    last_refill: Instant,
    last_request: Option<Instant>,
}

/// A rate limiter combining a token bucket refilled per minute with a
/// minimum interval between consecutive acquisitions.
///
/// `max_tokens_per_minute == 0` disables the token constraint but not the
/// minimum-interval constraint. The internal mutex is released while
/// sleeping; both constraints are re-checked after every wake.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: u32,
    min_interval: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(max_tokens_per_minute: u32, min_interval_ms: u64) -> Self {
        Self {
            max_tokens: max_tokens_per_minute,
            min_interval: Duration::from_millis(min_interval_ms),
            state: Mutex::new(LimiterState {
                tokens: max_tokens_per_minute,
                last_refill: Instant::now(),
                last_request: None,
            }),
        }
    }

    /// Per-check limiter: `rate_limit_per_minute` tokens with the matching
    /// pacing interval of `60000 / rate_limit_per_minute` ms.
    pub fn per_check(rate_limit_per_minute: u32) -> Self {
        let min_interval_ms = if rate_limit_per_minute > 0 {
            60_000 / u64::from(rate_limit_per_minute)
        } else {
            0
        };
        Self::new(rate_limit_per_minute, min_interval_ms)
    }

    /// Non-blocking acquire. Returns false when either the minimum
    /// inter-request interval has not elapsed or the bucket is empty.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if !self.min_interval_elapsed(&state, now) {
            return false;
        }

        if self.max_tokens == 0 {
            state.last_request = Some(now);
            return true;
        }

        self.refill(&mut state, now);
        if state.tokens == 0 {
            return false;
        }

        state.tokens -= 1;
        state.last_request = Some(now);
        true
    }

    /// Blocking acquire: sleeps until both constraints are satisfied.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        loop {
            let now = Instant::now();
            if let Some(last) = state.last_request {
                if !self.min_interval.is_zero() {
                    let since = now.duration_since(last);
                    if since < self.min_interval {
                        let wait = self.min_interval - since;
                        drop(state);
                        tokio::time::sleep(wait).await;
                        state = self.state.lock().await;
                        continue;
                    }
                }
            }
            break;
        }

        let mut now = Instant::now();
        if self.max_tokens == 0 {
            state.last_request = Some(now);
            return;
        }

        self.refill(&mut state, now);
        while state.tokens == 0 {
            let next_refill = state.last_refill + REFILL_WINDOW;
            if next_refill > now {
                let wait = next_refill - now;
                drop(state);
                tokio::time::sleep(wait).await;
                state = self.state.lock().await;
                now = Instant::now();
                self.refill(&mut state, now);
            } else {
                state.tokens = self.max_tokens;
                state.last_refill = now;
            }
        }

        state.tokens -= 1;
        state.last_request = Some(now);
    }

    fn min_interval_elapsed(&self, state: &LimiterState, now: Instant) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }
        match state.last_request {
            Some(last) => now.duration_since(last) >= self.min_interval,
            None => true,
        }
    }

    /// Add tokens for the elapsed fraction of a minute; a fully elapsed
    /// minute resets the bucket to max.
    fn refill(&self, state: &mut LimiterState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill);
        if elapsed >= REFILL_WINDOW {
            state.tokens = self.max_tokens;
            state.last_refill = now;
            return;
        }

        let tokens_to_add =
            (f64::from(self.max_tokens) * elapsed.as_secs_f64() / 60.0) as u32;
        if tokens_to_add > 0 {
            state.tokens = (state.tokens + tokens_to_add).min(self.max_tokens);
            state.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_exhaustion_blocks_until_refill() {
        let limiter = RateLimiter::new(3, 0);

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        // Fourth acquisition must wait for the bucket to refill.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_paces_consecutive_acquisitions() {
        let limiter = RateLimiter::new(0, 250);

        limiter.acquire().await;
        let first = Instant::now();
        limiter.acquire().await;
        assert!(first.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_tracks_blocking_acquire() {
        let limiter = RateLimiter::new(2, 0);

        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        // Bucket empty: non-blocking acquire must refuse.
        assert!(!limiter.try_acquire().await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_applies_without_token_constraint() {
        let limiter = RateLimiter::new(0, 1000);

        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill_grants_proportional_tokens() {
        let limiter = RateLimiter::new(60, 0);

        for _ in 0..60 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);

        // One second refills one token at 60/min.
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_check_limiter_derives_pacing_interval() {
        let limiter = RateLimiter::per_check(60);
        assert_eq!(limiter.min_interval, Duration::from_millis(1000));

        limiter.acquire().await;
        let t = Instant::now();
        limiter.acquire().await;
        assert!(t.elapsed() >= Duration::from_millis(1000));
    }
}
