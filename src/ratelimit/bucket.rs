//! Token-bucket primitive.
//!
//! A bucket holds up to `burst` tokens refilling at `rate` per second; one
//! token admits one request. Acquisition is reservation-free: a waiter
//! only removes a token at the moment one is available, so cancelling a
//! blocked `acquire` never loses budget.

use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::SyncError;

/// Mutable bucket state behind the lock.
#[derive(Debug)]
struct BucketState {
    /// Fractional tokens currently available.
    tokens: f64,
    /// Refill rate in tokens per second.
    rate: f64,
    /// Maximum tokens the bucket holds.
    burst: f64,
    /// Last refill instant.
    last_refill: tokio::time::Instant,
}

impl BucketState {
    /// Credits tokens accrued since the last refill, capped at burst.
    fn refill(&mut self) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// A single token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a bucket with the given rate (tokens/second) and burst,
    /// starting full.
    #[must_use]
    pub fn new(rate: u32, burst: u32) -> Self {
        let rate = f64::from(rate.max(1));
        let burst = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                rate,
                burst,
                last_refill: tokio::time::Instant::now(),
            }),
        }
    }

    /// Blocks until a token is available or the cancellation token fires.
    ///
    /// No budget is consumed if the wait is cancelled: the token is only
    /// taken once it exists.
    ///
    /// # Errors
    ///
    /// Returns a context-kind error on cancellation.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        loop {
            let wait = {
                #[allow(clippy::unwrap_used)]
                let mut state = self.state.lock().unwrap();
                state.refill();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(SyncError::cancelled("rate-limit wait cancelled"));
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes a token immediately if one is available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.refill();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Retunes the refill rate, crediting tokens accrued under the old
    /// rate first.
    pub fn set_rate(&self, rate: u32) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.refill();
        state.rate = f64::from(rate.max(1));
    }

    /// Current refill rate in whole tokens per second.
    #[must_use]
    pub fn rate(&self) -> u32 {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.rate as u32
    }
}
