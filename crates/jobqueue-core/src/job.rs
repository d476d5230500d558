//! Job record, state machine and execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if no identifier has been assigned.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job lifecycle state.
///
/// `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be picked up by the dispatcher.
    #[default]
    Waiting,
    /// Held by exactly one executing worker.
    Working,
    /// Processor completed successfully.
    Succeeded,
    /// Retry budget exhausted or job could not be processed.
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 4] = [
        JobState::Waiting,
        JobState::Working,
        JobState::Succeeded,
        JobState::Failed,
    ];

    /// Returns true for states that are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Returns the storage representation of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Working => "working",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "working" => Ok(JobState::Working),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID. Immutable once created.
    pub id: JobId,

    /// Topic selecting the processor. Immutable once created.
    pub topic: String,

    /// Current state.
    pub state: JobState,

    /// Opaque processor-defined payload.
    pub args: serde_json::Value,

    /// Concurrency pool. Immutable once created.
    pub rank: u32,

    /// Priority (higher = picked first).
    pub priority: i64,

    /// Number of failed attempts that were retried.
    pub retry_count: u32,

    /// Maximum number of retries after the first attempt.
    pub max_retry: u32,

    /// Correlation ID for looking up a single submission.
    pub correlation_id: Option<String>,

    /// Correlation group shared by related jobs.
    pub correlation_group: Option<String>,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job was last modified.
    pub updated_at: DateTime<Utc>,

    /// When the current or last attempt started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a waiting job for the given topic with rank 0, priority 0
    /// and no retries.
    pub fn new(topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            topic: topic.into(),
            state: JobState::Waiting,
            args: serde_json::Value::Null,
            rank: 0,
            priority: 0,
            retry_count: 0,
            max_retry: 0,
            correlation_id: None,
            correlation_group: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the job ID.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the rank.
    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the maximum number of retries.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the payload.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the correlation group.
    pub fn with_correlation_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = Some(group.into());
        self
    }

    /// Returns true if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns the 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Returns true if another failure would still be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// Marks the job as picked up by a worker. Only stores call this, from
    /// inside their atomic `next` operation.
    pub fn mark_working(&mut self) {
        let now = Utc::now();
        self.state = JobState::Working;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Returns a working job to the waiting state without consuming its
    /// retry budget.
    pub fn requeue(&mut self) {
        self.state = JobState::Waiting;
        self.started_at = None;
        self.updated_at = Utc::now();
    }

    /// Records a successful attempt.
    pub fn mark_succeeded(&mut self) {
        let now = Utc::now();
        self.state = JobState::Succeeded;
        self.last_error = None;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Records a failed attempt and returns the resulting state: `Waiting`
    /// while retries remain, `Failed` once the budget is spent.
    pub fn mark_attempt_failed(&mut self, error: impl Into<String>) -> JobState {
        if self.can_retry() {
            self.retry_count += 1;
            self.last_error = Some(error.into());
            self.requeue();
        } else {
            self.mark_failed(error);
        }
        self.state
    }

    /// Moves the job straight to `Failed`, regardless of remaining retries.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.state = JobState::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// Execution context handed to processors.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// Rank the job executes under.
    pub rank: u32,

    /// When this attempt started.
    pub started_at: DateTime<Utc>,

    cancellation: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job: &Job, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id.clone(),
            attempt: job.attempt(),
            max_attempts: job.max_retry + 1,
            rank: job.rank,
            started_at: job.started_at.unwrap_or_else(Utc::now),
            cancellation,
        }
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns true once the manager has begun shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the manager begins shutting down. Long-running
    /// processors should select on this to stop early.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
        assert!(!id1.is_empty());
        assert!(JobId::from("  ").is_empty());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("email");
        assert_eq!(job.topic, "email");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.rank, 0);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.attempt(), 1);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_builder() {
        let job = Job::new("report")
            .with_rank(2)
            .with_priority(-5)
            .with_max_retry(3)
            .with_args(serde_json::json!({"id": 7}))
            .with_correlation_id("#00001")
            .with_correlation_group("batch-1");

        assert_eq!(job.rank, 2);
        assert_eq!(job.priority, -5);
        assert_eq!(job.max_retry, 3);
        assert_eq!(job.args["id"], 7);
        assert_eq!(job.correlation_id.as_deref(), Some("#00001"));
        assert_eq!(job.correlation_group.as_deref(), Some("batch-1"));
    }

    #[test]
    fn test_failed_attempt_retries_until_budget_spent() {
        let mut job = Job::new("x").with_max_retry(2);

        job.mark_working();
        assert_eq!(job.mark_attempt_failed("first"), JobState::Waiting);
        assert_eq!(job.retry_count, 1);
        assert!(job.started_at.is_none());

        job.mark_working();
        assert_eq!(job.mark_attempt_failed("second"), JobState::Waiting);
        assert_eq!(job.retry_count, 2);

        job.mark_working();
        assert_eq!(job.mark_attempt_failed("third"), JobState::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.last_error.as_deref(), Some("third"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_no_retry_fails_immediately() {
        let mut job = Job::new("x");
        job.mark_working();
        assert_eq!(job.mark_attempt_failed("boom"), JobState::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_success_clears_last_error() {
        let mut job = Job::new("x").with_max_retry(1);
        job.mark_working();
        job.mark_attempt_failed("transient");
        job.mark_working();
        job.mark_succeeded();

        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.last_error.is_none());
        assert!(job.is_terminal());
    }

    #[test]
    fn test_requeue_keeps_retry_budget() {
        let mut job = Job::new("x").with_max_retry(1);
        job.mark_working();
        job.requeue();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_state_round_trip_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new("x").with_rank(1);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"state\":\"waiting\""));
        let restored: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_job_context() {
        let mut job = Job::new("x").with_max_retry(2);
        job.mark_working();
        let ctx = JobContext::new(&job, CancellationToken::new());

        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert!(!ctx.is_last_attempt());
        assert!(!ctx.is_cancelled());
    }
}
