//! Persistence contract consumed by the manager.

use crate::error::JobResult;
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a store reconciles jobs that were left `Working` by a previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupBehaviour {
    /// Return interrupted jobs to `Waiting` without consuming a retry.
    #[default]
    Requeue,
    /// Move interrupted jobs to `Failed`.
    MarkAsFailed,
}

/// Error recorded on jobs failed by [`StartupBehaviour::MarkAsFailed`].
pub const INTERRUPTED_JOB_ERROR: &str = "job was interrupted by a manager shutdown or crash";

/// Filter for [`Store::next`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextRequest {
    /// Ranks whose pools are saturated. Jobs of these ranks must not be
    /// returned.
    pub exclude_ranks: BTreeSet<u32>,
}

impl NextRequest {
    /// Returns true if jobs of `rank` may be returned.
    pub fn allows(&self, rank: u32) -> bool {
        !self.exclude_ranks.contains(&rank)
    }
}

/// Filter for [`Store::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRequest {
    /// Filter by topic.
    pub topic: Option<String>,

    /// Filter by correlation group.
    pub correlation_group: Option<String>,
}

impl StatsRequest {
    /// Returns true if `job` passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.topic.as_ref().map_or(true, |t| &job.topic == t)
            && self
                .correlation_group
                .as_ref()
                .map_or(true, |g| job.correlation_group.as_ref() == Some(g))
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Jobs waiting to be dispatched.
    pub waiting: u64,

    /// Jobs currently executing.
    pub working: u64,

    /// Jobs that completed successfully.
    pub succeeded: u64,

    /// Jobs that failed permanently.
    pub failed: u64,
}

impl Stats {
    /// Sum over all states.
    pub fn total(&self) -> u64 {
        self.waiting + self.working + self.succeeded + self.failed
    }

    /// Adds one job in `state` to the counts.
    pub fn record(&mut self, state: JobState) {
        self.add(state, 1);
    }

    /// Adds `count` jobs in `state` to the counts.
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Working => self.working += count,
            JobState::Succeeded => self.succeeded += count,
            JobState::Failed => self.failed += count,
        }
    }

    /// Returns the count for a single state.
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Working => self.working,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
        }
    }
}

/// Filter and pagination for [`Store::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    /// Filter by topic.
    pub topic: Option<String>,

    /// Filter by correlation group.
    pub correlation_group: Option<String>,

    /// Filter by correlation ID.
    pub correlation_id: Option<String>,

    /// Filter by state.
    pub state: Option<JobState>,

    /// Maximum number of jobs to return (0 = no limit).
    pub limit: usize,

    /// Number of jobs to skip.
    pub offset: usize,
}

impl ListRequest {
    /// Returns true if `job` passes the filters (pagination aside).
    pub fn matches(&self, job: &Job) -> bool {
        self.topic.as_ref().map_or(true, |t| &job.topic == t)
            && self
                .correlation_group
                .as_ref()
                .map_or(true, |g| job.correlation_group.as_ref() == Some(g))
            && self
                .correlation_id
                .as_ref()
                .map_or(true, |c| job.correlation_id.as_ref() == Some(c))
            && self.state.map_or(true, |s| job.state == s)
    }
}

/// Outcome of [`Store::list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Total number of matching jobs, ignoring pagination.
    pub total: u64,

    /// The requested page of jobs.
    pub jobs: Vec<Job>,
}

/// Durable job storage.
///
/// Implementations must be safe to share between the dispatch loop, the
/// execution tasks and any number of producers.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Called once when the manager starts. Jobs left `Working` by a
    /// previous run must be reconciled according to `behaviour`.
    async fn start(&self, behaviour: StartupBehaviour) -> JobResult<()>;

    /// Persist a new job. Fails with `DuplicateJob` if the ID exists.
    async fn create(&self, job: &Job) -> JobResult<()>;

    /// Persist changes to an existing job.
    async fn update(&self, job: &Job) -> JobResult<()>;

    /// Remove a job.
    async fn delete(&self, job: &Job) -> JobResult<()>;

    /// Atomically pick the waiting job with the highest priority (oldest
    /// first among equal priorities) outside `request.exclude_ranks`, mark
    /// it `Working` and return it. Returns `Ok(None)` when nothing is ready.
    /// Concurrent callers must never receive the same job.
    async fn next(&self, request: &NextRequest) -> JobResult<Option<Job>>;

    /// Count jobs per state.
    async fn stats(&self, request: &StatsRequest) -> JobResult<Stats>;

    /// Fetch a job by ID. Fails with `NotFound` if absent.
    async fn lookup(&self, id: &JobId) -> JobResult<Job>;

    /// Fetch all jobs with the given correlation ID. Empty if none match.
    async fn lookup_by_correlation_id(&self, correlation_id: &str) -> JobResult<Vec<Job>>;

    /// List jobs matching the request.
    async fn list(&self, request: &ListRequest) -> JobResult<ListResponse>;
}
