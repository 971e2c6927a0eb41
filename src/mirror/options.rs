use crate::pipeline::steps::list::{KEYS_PER_REQUEST, LIST_ATTEMPTS, LIST_BACKOFF};
use std::time::Duration;

pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_MAX_PASSES: u32 = 3;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);
/// Channel capacity of the replay source.
pub const REPLAY_BUFFER: usize = 32;

/// Tuning knobs of a mirror run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Workers of the filter, load and upload stages.
    pub workers: usize,
    pub list_page_size: usize,
    pub list_attempts: u32,
    pub list_backoff: Duration,
    /// Zero disables periodic reports; the final report is always logged.
    pub stats_interval: Duration,
    /// Passes in total, the first one included.
    pub max_passes: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            list_page_size: KEYS_PER_REQUEST,
            list_attempts: LIST_ATTEMPTS,
            list_backoff: LIST_BACKOFF,
            stats_interval: DEFAULT_STATS_INTERVAL,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

impl RunOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_list_page_size(mut self, page_size: usize) -> Self {
        self.list_page_size = page_size.max(1);
        self
    }

    pub fn with_list_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.list_attempts = attempts.max(1);
        self.list_backoff = backoff;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes.max(1);
        self
    }
}
