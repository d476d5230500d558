//! Integration tests for MySqlStore.
//!
//! These tests run against a real MySQL database using testcontainers.
//! Requires Docker to be available on the system.

mod common;

use common::TestDatabase;
use jobqueue_core::{
    testing, Job, JobState, Manager, NextRequest, StartupBehaviour, StatsRequest, Store,
};
use jobqueue_mysql::MySqlStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_store_contract() {
    let db = TestDatabase::new().await;
    testing::run_store_contract(|| db.empty_store()).await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_health_check() {
    let db = TestDatabase::new().await;
    db.pool().health_check().await.expect("health check failed");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_managers_share_one_table() {
    const JOBS: usize = 30;

    let db = TestDatabase::new().await;
    let runs = Arc::new(AtomicUsize::new(0));
    let mut managers = Vec::new();

    for _ in 0..2 {
        let manager = Manager::builder()
            .store(MySqlStore::new(db.pool()))
            .default_concurrency(3)
            .poll_interval(Duration::from_millis(20))
            .build()
            .expect("build failed");
        let runs = Arc::clone(&runs);
        manager
            .register("shared", move |_job, _ctx| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                }
            })
            .expect("register failed");
        manager.start().await.expect("start failed");
        managers.push(manager);
    }

    let mut ids = HashSet::new();
    for i in 0..JOBS {
        let job = managers[i % 2]
            .add(Job::new("shared").with_rank((i % 3) as u32))
            .await
            .expect("add failed");
        ids.insert(job.id);
    }

    let stats = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let stats = managers[0]
                .stats(&StatsRequest::default())
                .await
                .expect("stats failed");
            if stats.succeeded as usize == JOBS {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("jobs did not finish");

    for manager in &managers {
        manager.close().await.expect("close failed");
    }

    assert_eq!(stats.failed, 0);
    assert_eq!(runs.load(Ordering::SeqCst), JOBS);
    assert_eq!(ids.len(), JOBS);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_interrupted_job_resumes_after_restart() {
    let db = TestDatabase::new().await;
    let store = db.empty_store().await;

    // A previous process claimed the job and died.
    let job = Job::new("resume").with_correlation_id("#00001");
    store.create(&job).await.expect("create failed");
    let claimed = store
        .next(&NextRequest::default())
        .await
        .expect("next failed")
        .expect("job expected");
    assert_eq!(claimed.state, JobState::Working);

    let manager = Manager::builder()
        .store(MySqlStore::new(db.pool()))
        .startup_behaviour(StartupBehaviour::Requeue)
        .poll_interval(Duration::from_millis(20))
        .build()
        .expect("build failed");
    manager
        .register("resume", |_job, _ctx| async { Ok(()) })
        .expect("register failed");
    manager.start().await.expect("start failed");

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let jobs = manager
                .lookup_by_correlation_id("#00001")
                .await
                .expect("lookup failed");
            if jobs.iter().all(|j| j.state == JobState::Succeeded) {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job never resumed");

    manager.close().await.expect("close failed");

    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, job.id);
    assert_eq!(done[0].retry_count, 0);
}
