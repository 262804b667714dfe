//! Per-client admission control over the remote API.
//!
//! Three buckets: general requests, batch metadata, and export. The
//! ancillary buckets are retuned proportionally when the general rate
//! changes, so a quota-driven slowdown throttles everything.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bucket::TokenBucket;
use crate::errors::SyncError;

/// Default general request rate (tokens/second).
pub const DEFAULT_GENERAL_RATE: u32 = 10;
/// Default general burst.
pub const DEFAULT_GENERAL_BURST: u32 = 20;
/// Default batch-metadata rate.
pub const DEFAULT_BATCH_RATE: u32 = 5;
/// Default batch-metadata burst.
pub const DEFAULT_BATCH_BURST: u32 = 10;
/// Default export rate.
pub const DEFAULT_EXPORT_RATE: u32 = 3;
/// Default export burst.
pub const DEFAULT_EXPORT_BURST: u32 = 3;

/// Point-in-time admission metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterMetrics {
    /// Requests admitted (blocked or not).
    pub total_requests: u64,
    /// Requests that had to wait for a token.
    pub blocked_requests: u64,
    /// `blocked_requests / total_requests`, 0 when idle.
    pub blocked_fraction: f64,
    /// Admissions per second since the last metrics reset.
    pub requests_per_sec: f64,
}

/// Token-bucket admission to the remote API.
#[derive(Debug)]
pub struct ApiRateLimiter {
    general: TokenBucket,
    batch: TokenBucket,
    export: TokenBucket,
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    metrics_since: Mutex<tokio::time::Instant>,
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiRateLimiter {
    /// Creates a limiter with the default 10/5/3 rates and 20/10/3 bursts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rates(
            (DEFAULT_GENERAL_RATE, DEFAULT_GENERAL_BURST),
            (DEFAULT_BATCH_RATE, DEFAULT_BATCH_BURST),
            (DEFAULT_EXPORT_RATE, DEFAULT_EXPORT_BURST),
        )
    }

    /// Creates a limiter with explicit `(rate, burst)` pairs.
    #[must_use]
    pub fn with_rates(general: (u32, u32), batch: (u32, u32), export: (u32, u32)) -> Self {
        Self {
            general: TokenBucket::new(general.0, general.1),
            batch: TokenBucket::new(batch.0, batch.1),
            export: TokenBucket::new(export.0, export.1),
            total_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            metrics_since: Mutex::new(tokio::time::Instant::now()),
        }
    }

    /// Waits for a general-request token.
    ///
    /// # Errors
    ///
    /// Returns a context-kind error if the wait is cancelled; the budget
    /// is not consumed in that case.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.admit(&self.general, cancel).await
    }

    /// Waits for a batch-metadata token.
    ///
    /// # Errors
    ///
    /// Returns a context-kind error if the wait is cancelled.
    pub async fn wait_batch(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.admit(&self.batch, cancel).await
    }

    /// Waits for an export token.
    ///
    /// # Errors
    ///
    /// Returns a context-kind error if the wait is cancelled.
    pub async fn wait_export(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.admit(&self.export, cancel).await
    }

    /// Takes a general-request token without blocking.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let admitted = self.general.try_acquire();
        if admitted {
            self.total_requests.fetch_add(1, Ordering::SeqCst);
        }
        admitted
    }

    async fn admit(
        &self,
        bucket: &TokenBucket,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if bucket.try_acquire() {
            self.total_requests.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        self.blocked_requests.fetch_add(1, Ordering::SeqCst);
        bucket.acquire(cancel).await?;
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Retunes the general rate to `rate`, with batch at roughly half and
    /// export at roughly three tenths (both floored at 1).
    pub fn set_rate(&self, rate: u32) {
        let rate = rate.max(1);
        let batch = (rate / 2).max(1);
        let export = (rate * 3 / 10).max(1);
        debug!(rate, batch, export, "retuning rate limiter");
        self.general.set_rate(rate);
        self.batch.set_rate(batch);
        self.export.set_rate(export);
    }

    /// Current general rate.
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.general.rate()
    }

    /// Current batch-metadata rate.
    #[must_use]
    pub fn batch_rate(&self) -> u32 {
        self.batch.rate()
    }

    /// Current export rate.
    #[must_use]
    pub fn export_rate(&self) -> u32 {
        self.export.rate()
    }

    /// Snapshot of admission metrics since the last reset.
    #[must_use]
    pub fn metrics(&self) -> RateLimiterMetrics {
        let total = self.total_requests.load(Ordering::SeqCst);
        let blocked = self.blocked_requests.load(Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        let elapsed = self.metrics_since.lock().unwrap().elapsed().as_secs_f64();
        RateLimiterMetrics {
            total_requests: total,
            blocked_requests: blocked,
            blocked_fraction: if total > 0 {
                blocked as f64 / total as f64
            } else {
                0.0
            },
            requests_per_sec: if elapsed > 0.0 {
                total as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    /// Resets the admission counters and the req/s window.
    pub fn reset_metrics(&self) {
        self.total_requests.store(0, Ordering::SeqCst);
        self.blocked_requests.store(0, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        let mut since = self.metrics_since.lock().unwrap();
        *since = tokio::time::Instant::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_default_rates() {
        let limiter = ApiRateLimiter::new();
        assert_eq!(limiter.rate(), 10);
        assert_eq!(limiter.batch_rate(), 5);
        assert_eq!(limiter.export_rate(), 3);
    }

    #[tokio::test]
    async fn test_set_rate_retunes_proportionally() {
        let limiter = ApiRateLimiter::new();
        limiter.set_rate(20);
        assert_eq!(limiter.rate(), 20);
        assert_eq!(limiter.batch_rate(), 10);
        assert_eq!(limiter.export_rate(), 6);
    }

    #[tokio::test]
    async fn test_set_rate_floors_ancillary_buckets_at_one() {
        let limiter = ApiRateLimiter::new();
        limiter.set_rate(1);
        assert_eq!(limiter.rate(), 1);
        assert_eq!(limiter.batch_rate(), 1);
        assert_eq!(limiter.export_rate(), 1);
    }

    #[tokio::test]
    async fn test_metrics_count_blocked_requests() {
        tokio::time::pause();
        let limiter = ApiRateLimiter::with_rates((10, 1), (5, 10), (3, 3));
        let cancel = CancellationToken::new();

        limiter.wait(&cancel).await.unwrap(); // immediate
        limiter.wait(&cancel).await.unwrap(); // blocks ~100ms virtual

        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.blocked_requests, 1);
        assert!((metrics.blocked_fraction - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reset_metrics_zeroes_counters() {
        let limiter = ApiRateLimiter::new();
        assert!(limiter.try_wait());
        limiter.reset_metrics();
        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.blocked_requests, 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_context_error() {
        tokio::time::pause();
        let limiter = ApiRateLimiter::with_rates((1, 1), (1, 1), (1, 1));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        cancel.cancel();
        let err = limiter.wait(&cancel).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::SyncErrorKind::Context);

        // Cancelled waiter consumed nothing: one second refills one token.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_wait());
        assert!(!limiter.try_wait());
    }
}
