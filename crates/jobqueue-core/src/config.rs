//! Manager configuration.

use crate::error::{JobError, JobResult};
use crate::retry::RetryPolicy;
use crate::store::StartupBehaviour;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for a [`Manager`](crate::Manager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Concurrency of ranks without an explicit limit.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Explicit concurrency per rank.
    #[serde(default)]
    pub rank_concurrency: BTreeMap<u32, usize>,

    /// How long the dispatch loop sleeps when no job is ready, in
    /// milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Back-off after a job had to be put back because its rank was full,
    /// in milliseconds.
    #[serde(default = "default_saturation_backoff")]
    pub saturation_backoff_ms: u64,

    /// Back-off after a store error in the dispatch loop, in milliseconds.
    #[serde(default = "default_store_error_backoff")]
    pub store_error_backoff_ms: u64,

    /// How long `close` waits for in-flight jobs, in milliseconds. Negative
    /// waits indefinitely.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: i64,

    /// Handling of jobs left working by a previous run.
    #[serde(default)]
    pub startup_behaviour: StartupBehaviour,

    /// Backoff before failed jobs become eligible again.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            rank_concurrency: BTreeMap::new(),
            poll_interval_ms: default_poll_interval(),
            saturation_backoff_ms: default_saturation_backoff(),
            store_error_backoff_ms: default_store_error_backoff(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            startup_behaviour: StartupBehaviour::default(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    100
}

fn default_saturation_backoff() -> u64 {
    50
}

fn default_store_error_backoff() -> u64 {
    1000
}

fn default_shutdown_timeout() -> i64 {
    30_000
}

impl ManagerConfig {
    /// Get the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the saturation back-off as a Duration.
    pub fn saturation_backoff(&self) -> Duration {
        Duration::from_millis(self.saturation_backoff_ms)
    }

    /// Get the store error back-off as a Duration.
    pub fn store_error_backoff(&self) -> Duration {
        Duration::from_millis(self.store_error_backoff_ms)
    }

    /// Get the shutdown timeout, `None` meaning no deadline.
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        u64::try_from(self.shutdown_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }

    /// Concurrency limit for `rank`.
    pub fn concurrency_for(&self, rank: u32) -> usize {
        self.rank_concurrency
            .get(&rank)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Check the configuration for values the manager cannot run with.
    pub fn validate(&self) -> JobResult<()> {
        if self.default_concurrency == 0 {
            return Err(JobError::Configuration(
                "default_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(rank) = self
            .rank_concurrency
            .iter()
            .find_map(|(rank, limit)| (*limit == 0).then_some(*rank))
        {
            return Err(JobError::Configuration(format!(
                "concurrency for rank {rank} must be at least 1"
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(JobError::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
