//! Backend-agnostic contract suite for [`Store`] implementations.
//!
//! Every backend runs the same checks:
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn store_contract() {
//!     jobqueue_core::testing::run_store_contract(|| async { MyStore::connect().await }).await;
//! }
//! ```
//!
//! The factory must return an empty store each time it is called.

use crate::error::JobError;
use crate::job::{Job, JobId, JobState};
use crate::store::{ListRequest, NextRequest, StartupBehaviour, StatsRequest, Store};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Run every contract check, each against a fresh store.
pub async fn run_store_contract<S, F, Fut>(factory: F)
where
    S: Store,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    create_and_lookup(&factory().await).await;
    update_and_delete(&factory().await).await;
    next_respects_priority_then_age(&factory().await).await;
    next_skips_excluded_ranks(&factory().await).await;
    next_is_exclusive_under_concurrency(Arc::new(factory().await)).await;
    stats_count_by_state(&factory().await).await;
    correlation_lookup(&factory().await).await;
    list_filters_and_paginates(&factory().await).await;
    start_requeues_interrupted_jobs(&factory().await).await;
    start_fails_interrupted_jobs(&factory().await).await;
}

fn job_at(topic: &str, priority: i64, age_ms: i64) -> Job {
    let mut job = Job::new(topic).with_priority(priority);
    job.created_at = Utc::now() - ChronoDuration::milliseconds(age_ms);
    job.updated_at = job.created_at;
    job
}

/// Create persists every field; duplicates and misses are reported.
pub async fn create_and_lookup<S: Store>(store: &S) {
    let job = Job::new("contract")
        .with_rank(3)
        .with_priority(7)
        .with_max_retry(2)
        .with_args(serde_json::json!({"n": 1, "tags": ["a", "b"]}))
        .with_correlation_id("cid-1")
        .with_correlation_group("group-1");
    store.create(&job).await.expect("create failed");

    let found = store.lookup(&job.id).await.expect("lookup failed");
    assert_eq!(found.id, job.id);
    assert_eq!(found.topic, "contract");
    assert_eq!(found.state, JobState::Waiting);
    assert_eq!(found.rank, 3);
    assert_eq!(found.priority, 7);
    assert_eq!(found.max_retry, 2);
    assert_eq!(found.retry_count, 0);
    assert_eq!(found.args, job.args);
    assert_eq!(found.correlation_id.as_deref(), Some("cid-1"));
    assert_eq!(found.correlation_group.as_deref(), Some("group-1"));

    let duplicate = store.create(&job).await;
    assert!(matches!(duplicate, Err(JobError::DuplicateJob(_))));

    let missing = store.lookup(&JobId::new()).await;
    assert!(matches!(missing, Err(JobError::NotFound(_))));
}

/// Updates are persisted; updating or deleting a missing job is `NotFound`.
pub async fn update_and_delete<S: Store>(store: &S) {
    let mut job = Job::new("contract").with_max_retry(1);
    store.create(&job).await.expect("create failed");

    job.mark_working();
    job.mark_attempt_failed("first attempt failed");
    store.update(&job).await.expect("update failed");

    let found = store.lookup(&job.id).await.expect("lookup failed");
    assert_eq!(found.state, JobState::Waiting);
    assert_eq!(found.retry_count, 1);
    assert_eq!(found.last_error.as_deref(), Some("first attempt failed"));

    store.delete(&job).await.expect("delete failed");
    assert!(matches!(store.lookup(&job.id).await, Err(JobError::NotFound(_))));
    assert!(matches!(store.delete(&job).await, Err(JobError::NotFound(_))));
    assert!(matches!(store.update(&job).await, Err(JobError::NotFound(_))));
}

/// `next` returns higher priorities first, oldest first within a tier, and
/// marks the job working.
pub async fn next_respects_priority_then_age<S: Store>(store: &S) {
    let low = job_at("contract", 1, 3000);
    let high_young = job_at("contract", 5, 1000);
    let high_old = job_at("contract", 5, 2000);
    for job in [&low, &high_young, &high_old] {
        store.create(job).await.expect("create failed");
    }

    let request = NextRequest::default();
    let mut order = Vec::new();
    while let Some(job) = store.next(&request).await.expect("next failed") {
        assert_eq!(job.state, JobState::Working);
        assert!(job.started_at.is_some());
        order.push(job.id);
    }
    assert_eq!(order, vec![high_old.id.clone(), high_young.id, low.id]);

    let persisted = store.lookup(&high_old.id).await.expect("lookup failed");
    assert_eq!(persisted.state, JobState::Working);
}

/// Jobs of excluded ranks stay waiting.
pub async fn next_skips_excluded_ranks<S: Store>(store: &S) {
    let busy = job_at("contract", 10, 2000).with_rank(1);
    let free = job_at("contract", 0, 1000).with_rank(2);
    store.create(&busy).await.expect("create failed");
    store.create(&free).await.expect("create failed");

    let request = NextRequest {
        exclude_ranks: [1].into_iter().collect(),
    };
    let picked = store.next(&request).await.expect("next failed");
    assert_eq!(picked.map(|j| j.id), Some(free.id));
    assert!(store.next(&request).await.expect("next failed").is_none());

    let still_waiting = store.lookup(&busy.id).await.expect("lookup failed");
    assert_eq!(still_waiting.state, JobState::Waiting);
}

/// Concurrent callers never receive the same job.
pub async fn next_is_exclusive_under_concurrency<S: Store>(store: Arc<S>) {
    const JOBS: usize = 40;
    const CALLERS: usize = 8;

    for _ in 0..JOBS {
        store.create(&Job::new("contract")).await.expect("create failed");
    }

    let mut handles = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut popped = Vec::new();
            while let Some(job) = store.next(&NextRequest::default()).await.expect("next failed") {
                popped.push(job.id);
            }
            popped
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.expect("caller panicked") {
            assert!(seen.insert(id), "job handed out twice");
        }
    }
    assert_eq!(seen.len(), JOBS);
}

/// Stats count every state and honour filters.
pub async fn stats_count_by_state<S: Store>(store: &S) {
    let mut succeeded = Job::new("a").with_correlation_group("g1");
    let mut failed = Job::new("a");
    let waiting = Job::new("b").with_correlation_group("g1");
    for job in [&succeeded, &failed, &waiting] {
        store.create(job).await.expect("create failed");
    }
    succeeded.mark_succeeded();
    failed.mark_failed("boom");
    store.update(&succeeded).await.expect("update failed");
    store.update(&failed).await.expect("update failed");

    let all = store.stats(&StatsRequest::default()).await.expect("stats failed");
    assert_eq!((all.waiting, all.working, all.succeeded, all.failed), (1, 0, 1, 1));
    assert_eq!(all.total(), 3);

    let by_topic = store
        .stats(&StatsRequest {
            topic: Some("a".into()),
            ..Default::default()
        })
        .await
        .expect("stats failed");
    assert_eq!(by_topic.total(), 2);
    assert_eq!(by_topic.waiting, 0);

    let by_group = store
        .stats(&StatsRequest {
            correlation_group: Some("g1".into()),
            ..Default::default()
        })
        .await
        .expect("stats failed");
    assert_eq!((by_group.waiting, by_group.succeeded), (1, 1));
}

/// Correlation lookups return all matches, or nothing without an error.
pub async fn correlation_lookup<S: Store>(store: &S) {
    let first = Job::new("a").with_correlation_id("#00001");
    let second = Job::new("b").with_correlation_id("#00001");
    let other = Job::new("a").with_correlation_id("#00002");
    for job in [&first, &second, &other] {
        store.create(job).await.expect("create failed");
    }

    let found = store
        .lookup_by_correlation_id("#00001")
        .await
        .expect("lookup failed");
    let ids: HashSet<JobId> = found.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, HashSet::from([first.id, second.id]));

    let none = store
        .lookup_by_correlation_id("#99999")
        .await
        .expect("lookup of unknown correlation id must not fail");
    assert!(none.is_empty());
}

/// List filters jobs and reports the unpaginated total.
pub async fn list_filters_and_paginates<S: Store>(store: &S) {
    for i in 0..5 {
        store
            .create(&job_at("list", 0, 5000 - i * 100).with_correlation_group("g"))
            .await
            .expect("create failed");
    }
    store.create(&Job::new("other")).await.expect("create failed");

    let page = store
        .list(&ListRequest {
            topic: Some("list".into()),
            limit: 2,
            offset: 1,
            ..Default::default()
        })
        .await
        .expect("list failed");
    assert_eq!(page.total, 5);
    assert_eq!(page.jobs.len(), 2);
    assert!(page.jobs.iter().all(|j| j.topic == "list"));

    let everything = store.list(&ListRequest::default()).await.expect("list failed");
    assert_eq!(everything.total, 6);
    assert_eq!(everything.jobs.len(), 6);

    let by_state = store
        .list(&ListRequest {
            state: Some(JobState::Failed),
            ..Default::default()
        })
        .await
        .expect("list failed");
    assert_eq!(by_state.total, 0);
    assert!(by_state.jobs.is_empty());

    let past_end = store
        .list(&ListRequest {
            correlation_group: Some("g".into()),
            limit: 10,
            offset: 10,
            ..Default::default()
        })
        .await
        .expect("list failed");
    assert_eq!(past_end.total, 5);
    assert!(past_end.jobs.is_empty());
}

/// `Requeue` returns interrupted jobs to the queue.
pub async fn start_requeues_interrupted_jobs<S: Store>(store: &S) {
    store.create(&Job::new("a")).await.expect("create failed");
    let interrupted = store
        .next(&NextRequest::default())
        .await
        .expect("next failed")
        .expect("job expected");

    store
        .start(StartupBehaviour::Requeue)
        .await
        .expect("start failed");

    let job = store.lookup(&interrupted.id).await.expect("lookup failed");
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.retry_count, 0);
    let again = store.next(&NextRequest::default()).await.expect("next failed");
    assert_eq!(again.map(|j| j.id), Some(interrupted.id));
}

/// `MarkAsFailed` fails interrupted jobs and leaves others alone.
pub async fn start_fails_interrupted_jobs<S: Store>(store: &S) {
    store.create(&job_at("a", 0, 2000)).await.expect("create failed");
    let untouched = job_at("a", 0, 1000);
    store.create(&untouched).await.expect("create failed");
    let interrupted = store
        .next(&NextRequest::default())
        .await
        .expect("next failed")
        .expect("job expected");

    store
        .start(StartupBehaviour::MarkAsFailed)
        .await
        .expect("start failed");

    let failed = store.lookup(&interrupted.id).await.expect("lookup failed");
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.last_error.is_some());

    let waiting = store.lookup(&untouched.id).await.expect("lookup failed");
    assert_eq!(waiting.state, JobState::Waiting);
}
