//! Engine configuration.
//!
//! Defaults cover everything; a TOML file can override any subset. The
//! binary loads `SyncConfig::load`, library consumers usually build the
//! struct directly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::pool::{DEFAULT_MAX_RETRIES, DEFAULT_WORKERS, WorkerPoolConfig};
use crate::ratelimit::DEFAULT_GENERAL_RATE;
use crate::transfer::{DEFAULT_CHUNK_SIZE, TransferConfig};
use crate::walker::{DEFAULT_WALK_WORKERS, WalkStrategy, WalkerConfig};

/// Default checkpoint interval in seconds.
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 30;

/// Default session-wide error budget.
pub const DEFAULT_MAX_ERRORS: usize = 100;

/// Walker settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerSettings {
    /// `"bfs"` (default) or `"dfs"`.
    pub strategy: String,
    /// Listing workers for BFS.
    pub workers: usize,
    /// Maximum depth below the root; 0 means unlimited.
    pub max_depth: u32,
    /// Whether shortcuts are followed as subfolders.
    pub follow_shortcuts: bool,
    /// Include regex patterns.
    pub include: Vec<String>,
    /// Exclude regex patterns.
    pub exclude: Vec<String>,
}

impl Default for WalkerSettings {
    fn default() -> Self {
        Self {
            strategy: "bfs".to_string(),
            workers: DEFAULT_WALK_WORKERS,
            max_depth: 0,
            follow_shortcuts: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Download workers.
    pub workers: usize,
    /// Retry budget per file.
    pub max_retries: u32,
    /// Ranged-chunk size in bytes.
    pub chunk_size: u64,
    /// Seconds between checkpoints.
    pub checkpoint_interval_secs: u64,
    /// Session-wide error budget; exceeding it fails the session.
    pub max_errors: usize,
    /// Bandwidth cap in bytes/second; 0 disables shaping.
    pub bandwidth_limit: u64,
    /// Whether declared checksums are verified before publish.
    pub verify_checksums: bool,
    /// Base directory for the scratch dir; `None` means the system temp.
    pub scratch_base: Option<PathBuf>,
    /// General API request rate (requests/second).
    pub rate_limit: u32,
    /// Walker settings.
    pub walker: WalkerSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
            max_errors: DEFAULT_MAX_ERRORS,
            bandwidth_limit: 0,
            verify_checksums: true,
            scratch_base: None,
            rate_limit: DEFAULT_GENERAL_RATE,
            walker: WalkerSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Loads configuration from a TOML file, with defaults for anything
    /// the file omits.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error if the file cannot be read or parsed,
    /// or fails validation.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::config(format!("read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| SyncError::config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that would otherwise fail deep inside the
    /// engine.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error naming the offending field.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.workers == 0 {
            return Err(SyncError::config("workers must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::config("chunk_size must be at least 1"));
        }
        if self.rate_limit == 0 {
            return Err(SyncError::config("rate_limit must be at least 1"));
        }
        if self.walker.strategy != "bfs" && self.walker.strategy != "dfs" {
            return Err(SyncError::config(format!(
                "unknown walker strategy {:?} (expected \"bfs\" or \"dfs\")",
                self.walker.strategy
            )));
        }
        Ok(())
    }

    /// Transfer-layer view of this configuration.
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            scratch_base: self
                .scratch_base
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            chunk_size: self.chunk_size,
            verify_checksums: self.verify_checksums,
        }
    }

    /// Walker view of this configuration.
    #[must_use]
    pub fn walker_config(&self) -> WalkerConfig {
        WalkerConfig {
            strategy: if self.walker.strategy == "dfs" {
                WalkStrategy::Dfs
            } else {
                WalkStrategy::Bfs
            },
            workers: self.walker.workers.max(1),
            max_depth: self.walker.max_depth,
            follow_shortcuts: self.walker.follow_shortcuts,
            include: self.walker.include.clone(),
            exclude: self.walker.exclude.clone(),
            ..WalkerConfig::default()
        }
    }

    /// Worker-pool view of this configuration.
    #[must_use]
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            ..WorkerPoolConfig::default()
        }
    }
}
