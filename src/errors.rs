//! Error taxonomy shared across the sync engine.
//!
//! Every failure that crosses a component boundary is carried as a
//! [`SyncError`]: a [`SyncErrorKind`] plus a human-readable message and an
//! optional source. The kind drives policy — whether the worker pool
//! retries, which backoff curve applies, and whether the adaptive rate
//! limiter should be notified.
//!
//! # Classification
//!
//! | Kind | Retryable | Typical causes |
//! |------|-----------|----------------|
//! | `Network` | yes | 5xx responses, DNS, connection reset, timeouts |
//! | `Quota` | yes | 429, 403 with a rate-limit reason |
//! | `Permission` | no | 401, 404, 403 without a rate-limit reason |
//! | `Storage` | yes | local filesystem errors |
//! | `Corruption` | yes | checksum mismatch (restart from byte 0) |
//! | `Config` | no | invalid configuration values |
//! | `Context` | no | cancellation / deadline; unwinds cooperatively |
//! | `Api` | yes | anything else the remote returned |

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Maximum jitter fraction applied to backoff delays (±50%).
const JITTER_FRACTION: f64 = 0.5;

/// Category of a sync failure, used for retry and rate-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Transient network-level failure.
    Network,
    /// API quota exhaustion; feeds the adaptive rate limiter.
    Quota,
    /// Permanent permission/not-found failure.
    Permission,
    /// Local filesystem failure, typically transient.
    Storage,
    /// Checksum mismatch; retryable but restarts the transfer from byte 0.
    Corruption,
    /// Invalid configuration, permanent.
    Config,
    /// Cancellation or timeout, terminal for the operation.
    Context,
    /// General remote API failure, transient by default.
    Api,
}

impl SyncErrorKind {
    /// Returns the stable string used in the error log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Quota => "quota",
            Self::Permission => "permission",
            Self::Storage => "storage",
            Self::Corruption => "corruption",
            Self::Config => "config",
            Self::Context => "context",
            Self::Api => "api",
        }
    }

    /// Whether the worker pool should re-enqueue a failure of this kind.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        match self {
            Self::Network | Self::Quota | Self::Storage | Self::Corruption | Self::Api => true,
            Self::Permission | Self::Config | Self::Context => false,
        }
    }

    /// Base delay for the first retry of this kind.
    #[must_use]
    pub fn initial_backoff(self) -> Duration {
        match self {
            Self::Quota => Duration::from_secs(5),
            Self::Network | Self::Api | Self::Corruption => Duration::from_secs(1),
            Self::Storage => Duration::from_millis(500),
            // Not retryable; value only matters if a caller ignores that.
            Self::Permission | Self::Config | Self::Context => Duration::from_secs(1),
        }
    }

    /// Cap on the exponential backoff for this kind.
    #[must_use]
    pub fn max_backoff(self) -> Duration {
        match self {
            Self::Quota => Duration::from_secs(300),
            Self::Network | Self::Api => Duration::from_secs(120),
            Self::Storage | Self::Corruption => Duration::from_secs(60),
            Self::Permission | Self::Config | Self::Context => Duration::from_secs(60),
        }
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A categorized failure crossing a component boundary.
#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct SyncError {
    /// Taxonomy category.
    pub kind: SyncErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause, when one exists.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SyncError {
    /// Creates an error of the given kind.
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Network, message)
    }

    /// Creates a quota error.
    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Quota, message)
    }

    /// Creates a permission error.
    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Permission, message)
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Storage, message)
    }

    /// Creates a corruption error (checksum mismatch).
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Corruption, message)
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Config, message)
    }

    /// Creates a cancellation/timeout error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Context, message)
    }

    /// Creates a general API error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Api, message)
    }

    /// Whether the failure is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Renders the full cause chain for the error log's stack trace column.
    #[must_use]
    pub fn cause_chain(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str("\n  caused by: ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string()).with_source(err)
    }
}

/// Maps an HTTP status (plus an optional upstream reason string) to a kind.
///
/// 403 is ambiguous upstream: with a rate-limit reason it is quota pushback,
/// otherwise it is a hard permission failure.
#[must_use]
pub fn classify_status(status: u16, reason: Option<&str>) -> SyncErrorKind {
    match status {
        429 => SyncErrorKind::Quota,
        403 => {
            let rate_limited = reason.is_some_and(|r| {
                let r = r.to_ascii_lowercase();
                r.contains("ratelimit") || r.contains("rate limit") || r.contains("quota")
            });
            if rate_limited {
                SyncErrorKind::Quota
            } else {
                SyncErrorKind::Permission
            }
        }
        401 | 404 => SyncErrorKind::Permission,
        s if (500..600).contains(&s) => SyncErrorKind::Network,
        _ => SyncErrorKind::Api,
    }
}

/// Computes the retry delay for `attempt` (1-indexed) of an error kind.
///
/// Exponential with multiplier 2.0, capped per kind, then randomized ±50%
/// to avoid thundering-herd retries.
#[must_use]
pub fn delay_for_attempt(kind: SyncErrorKind, attempt: u32) -> Duration {
    let base = kind.initial_backoff().as_millis() as f64;
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = base * 2.0_f64.powi(exponent as i32);
    let capped = raw.min(kind.max_backoff().as_millis() as f64);

    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let with_jitter = (capped * (1.0 + jitter)).max(0.0);

    Duration::from_millis(with_jitter as u64)
}
