//! Random workload: processors with random latency and failures, a
//! producer adding jobs at random intervals, and a periodic stats line.

use jobqueue_config::DemoConfig;
use jobqueue_core::{Job, JobError, JobResult, Manager, Stats, StatsRequest};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Correlation id of the `n`-th added job.
pub fn correlation_id(n: u64) -> String {
    format!("#{n:05}")
}

/// Renders stats as a fixed-width line.
pub fn format_stats(stats: &Stats) -> String {
    format!(
        "Waiting={:6} Working={:6} Succeeded={:6} Failed={:6}",
        stats.waiting, stats.working, stats.succeeded, stats.failed
    )
}

/// Uniformly random duration in `[0, max)`, zero when `max` is zero.
fn random_below(max: Duration) -> Duration {
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..millis))
}

/// Builds the `n`-th job: random topic, random rank below `demo.ranks`.
pub fn random_job(demo: &DemoConfig, n: u64) -> JobResult<Job> {
    let mut rng = rand::rng();
    let topic = demo
        .topics
        .choose(&mut rng)
        .ok_or_else(|| JobError::Configuration("no demo topics configured".to_string()))?;
    let rank = rng.random_range(0..demo.ranks.max(1));

    Ok(Job::new(topic.clone())
        .with_rank(rank)
        .with_max_retry(demo.max_retry)
        .with_correlation_id(correlation_id(n)))
}

/// Registers one processor per demo topic. Each attempt sleeps up to
/// `run_time` and fails with probability `failure_rate`.
pub fn register_processors(manager: &Manager, demo: &DemoConfig) -> JobResult<()> {
    for topic in &demo.topics {
        let run_time = demo.run_time();
        let failure_rate = demo.failure_rate;

        manager.register(topic.clone(), move |job, ctx| async move {
            let pause = random_below(run_time);
            let fail = rand::rng().random::<f64>() < failure_rate;

            debug!(
                correlation_id = job.correlation_id.as_deref().unwrap_or_default(),
                attempt = ctx.attempt,
                ?pause,
                "Processing"
            );
            tokio::time::sleep(pause).await;

            if fail {
                anyhow::bail!("processor failed");
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Adds random jobs until `cancel` fires, pausing up to `fill_time` before
/// each one. Returns the number of jobs added.
pub async fn enqueue(
    manager: Manager,
    demo: DemoConfig,
    cancel: CancellationToken,
) -> JobResult<u64> {
    let mut added = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(added),
            () = tokio::time::sleep(random_below(demo.fill_time())) => {}
        }

        let job = manager.add(random_job(&demo, added + 1)?).await?;
        added += 1;
        debug!(
            job_id = %job.id,
            topic = %job.topic,
            rank = job.rank,
            correlation_id = job.correlation_id.as_deref().unwrap_or_default(),
            "Added job"
        );
    }
}

/// Logs the stats line every `every` until `cancel` fires.
pub async fn log_stats(manager: Manager, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match manager.stats(&StatsRequest::default()).await {
            Ok(stats) => info!("{}", format_stats(&stats)),
            Err(e) => warn!(error = %e, "Failed to read stats"),
        }
    }
}
