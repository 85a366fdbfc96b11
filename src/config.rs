//! Search tuning: defaults, optional TOML file, validation.
//!
//! Precedence is defaults ← `--config` TOML file ← command-line flags and
//! environment. Every field has a default, so an empty file is valid.
//!
//! ```toml
//! threads = 8
//! batch_size = 20000
//! checkpoint_every = 1000
//! checkpoint_interval_secs = 60
//! time_limit_secs = 3600.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SearchError;

/// Default checkpoint file name, resolved against the work directory.
pub const DEFAULT_CHECKPOINT_FILE: &str = "primecrawl.checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Worker threads; `None` uses the available hardware parallelism.
    pub threads: Option<usize>,
    /// Candidates per work unit. Bounds how far a deadline can be overshot.
    pub batch_size: u64,
    /// Save a checkpoint after this many newly merged primes.
    pub checkpoint_every: u64,
    /// Save a checkpoint at least this often, in seconds.
    pub checkpoint_interval_secs: u64,
    /// Wall-clock budget for this run, in seconds.
    pub time_limit_secs: Option<f64>,
    /// Re-run a failed unit once before giving up.
    pub retry_failed_units: bool,
    /// Consecutive failed checkpoint writes tolerated before aborting.
    pub max_checkpoint_failures: u32,
    /// Interval of the background status log line, in seconds.
    pub status_interval_secs: u64,
    /// Load an existing checkpoint; when false any prior state is discarded.
    pub resume: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            threads: None,
            batch_size: 10_000,
            checkpoint_every: 1_000,
            checkpoint_interval_secs: 60,
            time_limit_secs: None,
            retry_failed_units: true,
            max_checkpoint_failures: 3,
            status_interval_secs: 30,
            resume: true,
        }
    }
}

impl SearchConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SearchError> {
        toml::from_str(content).map_err(|e| SearchError::config(format!("invalid config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, SearchError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SearchError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.threads == Some(0) {
            return Err(SearchError::config("threads must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(SearchError::config("batch_size must be at least 1"));
        }
        if self.checkpoint_every == 0 {
            return Err(SearchError::config("checkpoint_every must be at least 1"));
        }
        if self.checkpoint_interval_secs == 0 {
            return Err(SearchError::config(
                "checkpoint_interval_secs must be at least 1",
            ));
        }
        if self.status_interval_secs == 0 {
            return Err(SearchError::config("status_interval_secs must be at least 1"));
        }
        if self.max_checkpoint_failures == 0 {
            return Err(SearchError::config(
                "max_checkpoint_failures must be at least 1",
            ));
        }
        if let Some(limit) = self.time_limit_secs {
            if Duration::try_from_secs_f64(limit).is_err() {
                return Err(SearchError::config(format!(
                    "time limit must be a non-negative number of seconds, got {}",
                    limit
                )));
            }
        }
        Ok(())
    }

    /// Number of worker threads to run.
    pub fn parallelism(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// `None` when unlimited, or when the value is not representable (which
    /// `validate` rejects).
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

/// Place a relative checkpoint path inside `work_dir` when one is given.
///
/// `work_dir` is typically a scheduler-provided scratch directory.
pub fn resolve_checkpoint_path(work_dir: Option<&Path>, checkpoint: &Path) -> PathBuf {
    match work_dir {
        Some(dir) if checkpoint.is_relative() => dir.join(checkpoint),
        _ => checkpoint.to_path_buf(),
    }
}
