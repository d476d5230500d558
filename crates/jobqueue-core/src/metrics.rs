//! Metrics for job queue monitoring.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding application installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue.
pub mod names {
    /// Total jobs added.
    pub const JOBS_ADDED_TOTAL: &str = "jobqueue_jobs_added_total";
    /// Total jobs handed to a processor.
    pub const JOBS_DISPATCHED_TOTAL: &str = "jobqueue_jobs_dispatched_total";
    /// Total jobs completed successfully.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "jobqueue_jobs_succeeded_total";
    /// Total failed attempts returned to the queue.
    pub const JOBS_RETRIED_TOTAL: &str = "jobqueue_jobs_retried_total";
    /// Total jobs failed permanently.
    pub const JOBS_FAILED_TOTAL: &str = "jobqueue_jobs_failed_total";
    /// Total jobs put back because their rank was saturated.
    pub const JOBS_REQUEUED_TOTAL: &str = "jobqueue_jobs_requeued_total";
    /// Total processor panics.
    pub const JOBS_PANICKED_TOTAL: &str = "jobqueue_jobs_panicked_total";

    /// Processor execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "jobqueue_job_duration_seconds";

    /// Executions currently holding a rank slot.
    pub const RANK_IN_FLIGHT: &str = "jobqueue_rank_in_flight";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ADDED_TOTAL, "Total number of jobs added");
    describe_counter!(
        names::JOBS_DISPATCHED_TOTAL,
        "Total number of jobs handed to a processor"
    );
    describe_counter!(
        names::JOBS_SUCCEEDED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts returned to the queue"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that failed permanently"
    );
    describe_counter!(
        names::JOBS_REQUEUED_TOTAL,
        "Total number of jobs put back because their rank was saturated"
    );
    describe_counter!(
        names::JOBS_PANICKED_TOTAL,
        "Total number of processor panics"
    );

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Processor execution duration in seconds"
    );

    describe_gauge!(
        names::RANK_IN_FLIGHT,
        "Number of executions holding a slot of the rank"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job added.
    pub fn job_added(topic: &str, rank: u32) {
        counter!(
            names::JOBS_ADDED_TOTAL,
            "topic" => topic.to_string(),
            "rank" => rank.to_string()
        )
        .increment(1);
    }

    /// Record a job handed to its processor.
    pub fn job_dispatched(topic: &str, rank: u32) {
        counter!(
            names::JOBS_DISPATCHED_TOTAL,
            "topic" => topic.to_string(),
            "rank" => rank.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_succeeded(topic: &str, duration: Duration) {
        counter!(
            names::JOBS_SUCCEEDED_TOTAL,
            "topic" => topic.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "topic" => topic.to_string(),
            "status" => "succeeded"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt that will be retried.
    pub fn job_retried(topic: &str, attempt: u32, duration: Duration) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "topic" => topic.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "topic" => topic.to_string(),
            "status" => "retried"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed permanently.
    pub fn job_failed(topic: &str, reason: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "topic" => topic.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "topic" => topic.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job put back because its rank had no free slot.
    pub fn job_requeued(topic: &str, rank: u32) {
        counter!(
            names::JOBS_REQUEUED_TOTAL,
            "topic" => topic.to_string(),
            "rank" => rank.to_string()
        )
        .increment(1);
    }

    /// Record a processor panic.
    pub fn job_panicked(topic: &str) {
        counter!(
            names::JOBS_PANICKED_TOTAL,
            "topic" => topic.to_string()
        )
        .increment(1);
    }
}

/// Rank pool metrics recorder.
#[derive(Clone)]
pub struct RankMetrics;

impl RankMetrics {
    /// Update the number of executions holding a slot of `rank`.
    pub fn update_in_flight(rank: u32, in_flight: usize) {
        gauge!(
            names::RANK_IN_FLIGHT,
            "rank" => rank.to_string()
        )
        .set(in_flight as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // No recorder installed; registration must still be harmless.
        register_metrics();
    }

    #[test]
    fn test_job_metrics() {
        JobMetrics::job_added("a", 0);
        JobMetrics::job_dispatched("a", 0);
        JobMetrics::job_succeeded("a", Duration::from_millis(10));
        JobMetrics::job_retried("a", 1, Duration::from_millis(10));
        JobMetrics::job_failed("a", "processor_error", Duration::from_secs(1));
        JobMetrics::job_requeued("a", 0);
        JobMetrics::job_panicked("a");
        RankMetrics::update_in_flight(0, 3);
    }
}
