//! Quota-driven adaptation of the request rate.
//!
//! Two consecutive quota errors halve the current rate (floored at 1).
//! Once the rate sits below its base, successes grow it back one step at a
//! time, but only after a strict 30-second cooldown from the last decrease
//! so the rate cannot oscillate between halving and restoring.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::limiter::ApiRateLimiter;

/// Cooldown after a decrease before successes may grow the rate again.
const GROWTH_COOLDOWN: Duration = Duration::from_secs(30);

/// Consecutive quota errors that trigger a halving.
const QUOTA_ERROR_THRESHOLD: u32 = 2;

#[derive(Debug)]
struct AdaptiveState {
    current_rate: u32,
    consecutive_quota_errors: u32,
    last_decrease: Option<tokio::time::Instant>,
}

/// Wraps an [`ApiRateLimiter`] with quota-feedback tuning.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    limiter: Arc<ApiRateLimiter>,
    base_rate: u32,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveLimiter {
    /// Wraps a limiter whose current general rate becomes the base rate.
    #[must_use]
    pub fn new(limiter: Arc<ApiRateLimiter>) -> Self {
        let base_rate = limiter.rate();
        Self {
            limiter,
            base_rate,
            state: Mutex::new(AdaptiveState {
                current_rate: base_rate,
                consecutive_quota_errors: 0,
                last_decrease: None,
            }),
        }
    }

    /// The underlying limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<ApiRateLimiter> {
        &self.limiter
    }

    /// The rate the limiter recovers toward.
    #[must_use]
    pub fn base_rate(&self) -> u32 {
        self.base_rate
    }

    /// Current adapted rate.
    #[must_use]
    pub fn current_rate(&self) -> u32 {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.current_rate
    }

    /// Records a quota (429-class) error. The second consecutive error
    /// halves the rate, floored at 1.
    pub fn record_quota_error(&self) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.consecutive_quota_errors += 1;
        if state.consecutive_quota_errors < QUOTA_ERROR_THRESHOLD {
            return;
        }

        state.consecutive_quota_errors = 0;
        let halved = (state.current_rate / 2).max(1);
        if halved != state.current_rate {
            info!(
                from = state.current_rate,
                to = halved,
                "quota pressure: halving request rate"
            );
            state.current_rate = halved;
            self.limiter.set_rate(halved);
        }
        state.last_decrease = Some(tokio::time::Instant::now());
    }

    /// Records a successful request. Below the base rate, and strictly
    /// after the cooldown since the last decrease, each success raises the
    /// rate by one until the base is restored.
    pub fn record_success(&self) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.consecutive_quota_errors = 0;

        if state.current_rate >= self.base_rate {
            return;
        }
        let cooled_down = state
            .last_decrease
            .is_none_or(|at| at.elapsed() >= GROWTH_COOLDOWN);
        if !cooled_down {
            return;
        }

        state.current_rate += 1;
        debug!(rate = state.current_rate, base = self.base_rate, "growing request rate");
        self.limiter.set_rate(state.current_rate);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn adaptive() -> AdaptiveLimiter {
        AdaptiveLimiter::new(Arc::new(ApiRateLimiter::new()))
    }

    #[tokio::test]
    async fn test_single_quota_error_does_not_halve() {
        let limiter = adaptive();
        limiter.record_quota_error();
        assert_eq!(limiter.current_rate(), 10);
    }

    #[tokio::test]
    async fn test_two_consecutive_quota_errors_halve_rate() {
        let limiter = adaptive();
        limiter.record_quota_error();
        limiter.record_quota_error();
        assert_eq!(limiter.current_rate(), 5);
        assert_eq!(limiter.limiter().rate(), 5);
        // Ancillary buckets follow.
        assert_eq!(limiter.limiter().batch_rate(), 2);
        assert_eq!(limiter.limiter().export_rate(), 1);
    }

    #[tokio::test]
    async fn test_success_between_quota_errors_resets_the_streak() {
        let limiter = adaptive();
        limiter.record_quota_error();
        limiter.record_success();
        limiter.record_quota_error();
        assert_eq!(limiter.current_rate(), 10, "streak was broken");
    }

    #[tokio::test]
    async fn test_rate_floors_at_one() {
        let limiter = adaptive();
        for _ in 0..20 {
            limiter.record_quota_error();
            limiter.record_quota_error();
        }
        assert_eq!(limiter.current_rate(), 1);
    }

    #[tokio::test]
    async fn test_successes_within_cooldown_do_not_restore_rate() {
        tokio::time::pause();
        let limiter = adaptive();
        limiter.record_quota_error();
        limiter.record_quota_error();
        assert_eq!(limiter.current_rate(), 5);

        // Inside the 30s cooldown nothing grows.
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.record_success();
        limiter.record_success();
        limiter.record_success();
        assert_eq!(limiter.current_rate(), 5);
    }

    #[tokio::test]
    async fn test_successes_after_cooldown_grow_back_to_base() {
        tokio::time::pause();
        let limiter = adaptive();
        limiter.record_quota_error();
        limiter.record_quota_error();
        assert_eq!(limiter.current_rate(), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        for expected in [6, 7, 8, 9, 10] {
            limiter.record_success();
            assert_eq!(limiter.current_rate(), expected);
        }

        // At base, further successes are a no-op.
        limiter.record_success();
        assert_eq!(limiter.current_rate(), 10);
        assert_eq!(limiter.limiter().rate(), 10);
    }

    #[tokio::test]
    async fn test_new_decrease_restarts_cooldown() {
        tokio::time::pause();
        let limiter = adaptive();
        limiter.record_quota_error();
        limiter.record_quota_error();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.record_success();
        assert_eq!(limiter.current_rate(), 6);

        // Another halving restarts the clock.
        limiter.record_quota_error();
        limiter.record_quota_error();
        assert_eq!(limiter.current_rate(), 3);
        tokio::time::advance(Duration::from_secs(15)).await;
        limiter.record_success();
        assert_eq!(limiter.current_rate(), 3, "cooldown must be strict");
    }
}
