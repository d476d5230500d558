//! Runs one attempt of a job and records its outcome.

use crate::error::JobError;
use crate::job::{Job, JobContext, JobState};
use crate::metrics::JobMetrics;
use crate::processor::Processor;
use crate::rank::RankPermit;
use crate::retry::RetryPolicy;
use crate::store::Store;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Everything an execution task needs besides the job itself.
#[derive(Clone)]
pub(crate) struct ExecutionEnv {
    pub store: Arc<dyn Store>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

/// Invoke `processor` for `job`, map the result onto the job's state
/// machine and persist it. The rank slot held by `permit` is released
/// before a retry backoff, otherwise when this returns.
pub(crate) async fn execute(
    env: ExecutionEnv,
    processor: Arc<dyn Processor>,
    mut job: Job,
    permit: RankPermit,
) {
    let ctx = JobContext::new(&job, env.cancel.clone());
    let started = Instant::now();

    debug!(attempt = ctx.attempt, max_attempts = ctx.max_attempts, "Processing job");

    let attempt = {
        let job = job.clone();
        // The call itself sits inside the block so that a processor
        // panicking before returning its future is caught as well.
        AssertUnwindSafe(async move { processor.process(job, ctx).await })
            .catch_unwind()
            .await
    };
    let elapsed = started.elapsed();

    let failure = match attempt {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(JobError::ProcessorFailure(format!("{e:#}"))),
        Err(payload) => {
            JobMetrics::job_panicked(&job.topic);
            Some(JobError::ProcessorFailure(format!(
                "processor panicked: {}",
                panic_message(payload.as_ref())
            )))
        }
    };

    let mut permit = Some(permit);

    match failure {
        None => {
            job.mark_succeeded();
            JobMetrics::job_succeeded(&job.topic, elapsed);
            debug!(duration_ms = elapsed.as_millis() as u64, "Job succeeded");
        }
        Some(failure) if job.can_retry() => {
            let delay = env.retry.delay_for_retry(job.retry_count + 1);
            warn!(
                error = %failure,
                attempt = job.attempt(),
                max_attempts = job.max_retry + 1,
                retry_delay_ms = delay.as_millis() as u64,
                "Job attempt failed, will retry"
            );
            JobMetrics::job_retried(&job.topic, job.attempt(), elapsed);
            if !delay.is_zero() {
                // The job stays Working in the store while it backs off, but
                // its rank slot is free for other jobs.
                drop(permit.take());
                backoff(delay, &env.cancel).await;
            }
            job.mark_attempt_failed(failure.to_string());
        }
        Some(failure) => {
            warn!(error = %failure, attempt = job.attempt(), "Job failed permanently");
            JobMetrics::job_failed(&job.topic, "processor_error", elapsed);
            job.mark_failed(failure.to_string());
        }
    }

    persist(env.store.as_ref(), &job).await;
    drop(permit);
}

/// Record a job that cannot be executed because its topic has no
/// processor.
pub(crate) async fn fail_unroutable(store: &dyn Store, mut job: Job) {
    warn!(
        job_id = %job.id,
        topic = %job.topic,
        "No processor registered for topic, failing job"
    );
    job.mark_failed(format!("no processor registered for topic {:?}", job.topic));
    JobMetrics::job_failed(&job.topic, "no_processor", Duration::ZERO);
    persist(store, &job).await;
}

async fn persist(store: &dyn Store, job: &Job) {
    match store.update(job).await {
        Ok(()) => {
            if job.state != JobState::Waiting {
                debug!(job_id = %job.id, state = %job.state, "Recorded job outcome");
            }
        }
        Err(e) => {
            error!(
                job_id = %job.id,
                state = %job.state,
                error = %e,
                "Failed to record job outcome"
            );
        }
    }
}

async fn backoff(delay: Duration, cancel: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {
            debug!("Retry backoff cut short by shutdown");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::processor::FnProcessor;
    use crate::rank::RankPools;
    use crate::store::NextRequest;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        pools: RankPools,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                pools: RankPools::new(1, &BTreeMap::new()).unwrap(),
            }
        }

        fn env(&self, retry: RetryPolicy) -> ExecutionEnv {
            ExecutionEnv {
                store: self.store.clone(),
                retry,
                cancel: CancellationToken::new(),
            }
        }

        async fn pop(&self, job: Job) -> (Job, RankPermit) {
            self.store.create(&job).await.unwrap();
            let job = self.store.next(&NextRequest::default()).await.unwrap().unwrap();
            let permit = self.pools.try_acquire(job.rank).unwrap();
            (job, permit)
        }
    }

    fn succeeding() -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(|_job: Job, _ctx: JobContext| async {
            anyhow::Ok(())
        }))
    }

    fn failing() -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(|_job: Job, _ctx: JobContext| async {
            Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
        }))
    }

    #[tokio::test]
    async fn test_success_marks_succeeded() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a")).await;

        execute(fx.env(RetryPolicy::none()), succeeding(), job.clone(), permit).await;

        let stored = fx.store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert!(stored.completed_at.is_some());
        assert_eq!(fx.pools.in_flight(0), 0);
    }

    #[tokio::test]
    async fn test_failure_with_retries_left_requeues() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a").with_max_retry(2)).await;

        execute(fx.env(RetryPolicy::none()), failing(), job.clone(), permit).await;

        let stored = fx.store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn test_failure_without_retries_fails() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a")).await;

        execute(fx.env(RetryPolicy::none()), failing(), job.clone(), permit).await;

        let stored = fx.store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a")).await;
        let panicking: Arc<dyn Processor> =
            Arc::new(FnProcessor::new(|_job: Job, _ctx: JobContext| async {
                if true {
                    panic!("processor exploded");
                }
                anyhow::Ok(())
            }));

        execute(fx.env(RetryPolicy::none()), panicking, job.clone(), permit).await;

        let stored = fx.store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("processor exploded")));
        assert_eq!(fx.pools.in_flight(0), 0);
    }

    #[tokio::test]
    async fn test_slot_released_when_update_fails() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a")).await;
        fx.store.delete(&job).await.unwrap();

        execute(fx.env(RetryPolicy::none()), succeeding(), job, permit).await;

        assert_eq!(fx.pools.in_flight(0), 0);
        assert!(fx.pools.try_acquire(0).is_some());
    }

    #[tokio::test]
    async fn test_retry_backoff_cut_short_by_cancel() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a").with_max_retry(1)).await;
        let env = fx.env(RetryPolicy::fixed(Duration::from_secs(60)));
        env.cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            execute(env, failing(), job.clone(), permit),
        )
        .await
        .expect("backoff should not outlive shutdown");

        let stored = fx.store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_backoff_frees_rank_slot() {
        let fx = Fixture::new();
        let (job, permit) = fx.pop(Job::new("a").with_max_retry(1)).await;
        let env = fx.env(RetryPolicy::fixed(Duration::from_secs(60)));
        let cancel = env.cancel.clone();

        let running = tokio::spawn(execute(env, failing(), job.clone(), permit));

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.pools.in_flight(0) != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("rank slot held during backoff");
        assert!(fx.pools.try_acquire(0).is_some());
        assert_eq!(
            fx.store.lookup(&job.id).await.unwrap().state,
            JobState::Working
        );

        cancel.cancel();
        running.await.unwrap();

        let stored = fx.store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_fail_unroutable() {
        let store = MemoryStore::new();
        store.create(&Job::new("ghost")).await.unwrap();
        let job = store.next(&NextRequest::default()).await.unwrap().unwrap();

        fail_unroutable(&store, job.clone()).await;

        let stored = store.lookup(&job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.last_error.unwrap().contains("ghost"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
