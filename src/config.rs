use serde::{Deserialize, Serialize};

use crate::batch::MAX_BATCH_CAPACITY;
use crate::error::CoreError;
use crate::search::DEFAULT_TOKEN_LENGTHS;

const DEFAULT_MAX_CONCURRENT_COMMITS: usize = 8;
const DEFAULT_SLOW_RUN_WARN_MS: u64 = 30_000;

/// Controls how a run batches and commits its updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackfillConfig {
    /// Entries per batch. The store's hard limit can be lowered, never raised.
    pub batch_capacity: usize,
    /// Upper bound on batch commits in flight at once.
    pub max_concurrent_commits: usize,
    /// N-gram lengths derived from the canonical name.
    pub token_lengths: Vec<usize>,
    /// Runs taking at least this long are logged as slow. 0 disables the warning.
    pub slow_run_warn_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_capacity: MAX_BATCH_CAPACITY,
            max_concurrent_commits: DEFAULT_MAX_CONCURRENT_COMMITS,
            token_lengths: DEFAULT_TOKEN_LENGTHS.to_vec(),
            slow_run_warn_ms: DEFAULT_SLOW_RUN_WARN_MS,
        }
    }
}

impl BackfillConfig {
    pub fn batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    pub fn max_concurrent_commits(mut self, limit: usize) -> Self {
        self.max_concurrent_commits = limit;
        self
    }

    pub fn token_lengths(mut self, lengths: Vec<usize>) -> Self {
        self.token_lengths = lengths;
        self
    }

    pub fn slow_run_warn_ms(mut self, threshold_ms: u64) -> Self {
        self.slow_run_warn_ms = threshold_ms;
        self
    }

    pub(crate) fn is_slow_run(&self, elapsed_ms: i64) -> bool {
        self.slow_run_warn_ms > 0
            && u64::try_from(elapsed_ms).is_ok_and(|elapsed| elapsed >= self.slow_run_warn_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(1..=MAX_BATCH_CAPACITY).contains(&self.batch_capacity) {
            return Err(CoreError::Configuration(format!(
                "batchCapacity must be between 1 and {MAX_BATCH_CAPACITY}, got {}",
                self.batch_capacity
            )));
        }
        if self.max_concurrent_commits == 0 {
            return Err(CoreError::Configuration(
                "maxConcurrentCommits must be greater than 0".to_string(),
            ));
        }
        if self.token_lengths.is_empty() || self.token_lengths.contains(&0) {
            return Err(CoreError::Configuration(
                "tokenLengths must be a non-empty list of positive lengths".to_string(),
            ));
        }
        Ok(())
    }
}
