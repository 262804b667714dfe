//! Download task and priority assignment.

use std::cmp::Ordering;

use crate::store::FileRecord;

/// Priority bucket boundaries. Smaller files get smaller priority numbers
/// and run first, so progress becomes visible quickly.
const MIB: u64 = 1024 * 1024;

/// Priority penalty added per prior attempt, pushing retries behind fresh
/// work.
pub const RETRY_PRIORITY_PENALTY: i64 = 1000;

/// Returns the queue priority for a file of `size` bytes at `index`
/// within its batch. Lower runs first.
#[must_use]
pub fn priority_for_size(size: u64, index: usize) -> i64 {
    let bucket = if size < MIB {
        0
    } else if size < 10 * MIB {
        1000
    } else if size < 100 * MIB {
        2000
    } else {
        3000
    };
    bucket + i64::try_from(index).unwrap_or(0)
}

/// A unit of work for the download workers.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// The file to transfer.
    pub file: FileRecord,
    /// Queue priority; lower dispatches first.
    pub priority: i64,
    /// Attempts already made before this task was queued.
    pub attempt: u32,
    /// Error message from the previous attempt, if any.
    pub last_error: Option<String>,
    /// Monotonic sequence assigned at enqueue time.
    pub(crate) seq: u64,
}

impl DownloadTask {
    /// Creates a fresh task for a file.
    #[must_use]
    pub fn new(file: FileRecord, priority: i64) -> Self {
        Self {
            file,
            priority,
            attempt: 0,
            last_error: None,
            seq: 0,
        }
    }

    /// Derives the retry task for a failed attempt, pushed behind fresh
    /// work by the attempt penalty.
    #[must_use]
    pub fn retry(mut self, error: &str) -> Self {
        self.attempt += 1;
        self.priority += RETRY_PRIORITY_PENALTY * i64::from(self.attempt);
        self.last_error = Some(error.to_string());
        self
    }
}

impl PartialEq for DownloadTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for DownloadTask {}

impl PartialOrd for DownloadTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DownloadTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}
