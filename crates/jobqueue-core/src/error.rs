//! Job queue error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for job queue operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job queue errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found in the store.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A job with the same identifier already exists.
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// A processor is already registered for the topic.
    #[error("Processor already registered for topic: {0}")]
    DuplicateTopic(String),

    /// Topic is empty or otherwise unusable.
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    /// No processor registered for the topic.
    #[error("No processor registered for topic: {0}")]
    NoProcessor(String),

    /// Job failed validation before being persisted.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Persistence layer failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Processor returned an error or panicked. Displays as the processor's
    /// own message, which becomes the job's `last_error`.
    #[error("{0}")]
    ProcessorFailure(String),

    /// In-flight jobs did not drain before the shutdown deadline.
    #[error("Shutdown timed out after {0:?} with jobs still in flight")]
    ShutdownTimeout(Duration),

    /// Manager was already started.
    #[error("Manager already started")]
    AlreadyStarted,

    /// Manager is not running.
    #[error("Manager is not running")]
    NotRunning,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl JobError {
    /// Returns true if this is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_))
    }
}
