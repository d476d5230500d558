//! The dispatch loop: the single task that pulls ready jobs from the store
//! and hands them to execution tasks.

use crate::execution::{self, ExecutionEnv};
use crate::metrics::JobMetrics;
use crate::processor::ProcessorRegistry;
use crate::rank::RankPools;
use crate::store::NextRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, Instrument};

/// What one iteration of the loop achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// A job was handled; look for the next one right away.
    Dispatched,
    /// Nothing is ready.
    Idle,
    /// A job had to be put back because its rank was full.
    Saturated,
    /// The store failed.
    StoreError,
}

pub(crate) struct Dispatcher {
    pub env: ExecutionEnv,
    pub registry: Arc<ProcessorRegistry>,
    pub pools: Arc<RankPools>,
    pub tracker: TaskTracker,
    /// Signalled when a job is added.
    pub added: Arc<Notify>,
    pub poll_interval: Duration,
    pub saturation_backoff: Duration,
    pub store_error_backoff: Duration,
}

impl Dispatcher {
    /// Run until the shutdown token is cancelled.
    pub(crate) async fn run(self) {
        info!("Dispatch loop started");
        let released = self.pools.released();

        while !self.env.cancel.is_cancelled() {
            match self.tick().await {
                Tick::Dispatched => {}
                Tick::Idle => {
                    tokio::select! {
                        _ = self.env.cancel.cancelled() => {}
                        _ = self.added.notified() => {}
                        _ = released.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Tick::Saturated => self.pause(self.saturation_backoff).await,
                Tick::StoreError => self.pause(self.store_error_backoff).await,
            }
        }

        info!("Dispatch loop stopped");
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.env.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn tick(&self) -> Tick {
        let request = NextRequest {
            exclude_ranks: self.pools.saturated_ranks(),
        };

        let mut job = match self.env.store.next(&request).await {
            Ok(Some(job)) => job,
            Ok(None) => return Tick::Idle,
            Err(e) => {
                error!(error = %e, "Failed to fetch next job");
                return Tick::StoreError;
            }
        };

        // Shutdown began while the store was picking the job.
        if self.env.cancel.is_cancelled() {
            debug!(job_id = %job.id, "Shutting down, putting job back");
            job.requeue();
            if let Err(e) = self.env.store.update(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to put job back");
            }
            return Tick::Dispatched;
        }

        let processor = match self.registry.lookup(&job.topic) {
            Ok(processor) => processor,
            Err(_) => {
                execution::fail_unroutable(self.env.store.as_ref(), job).await;
                return Tick::Dispatched;
            }
        };

        let Some(permit) = self.pools.try_acquire(job.rank) else {
            debug!(
                job_id = %job.id,
                rank = job.rank,
                "Rank saturated, putting job back"
            );
            JobMetrics::job_requeued(&job.topic, job.rank);
            job.requeue();
            if let Err(e) = self.env.store.update(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to put job back");
            }
            return Tick::Saturated;
        };

        JobMetrics::job_dispatched(&job.topic, job.rank);
        let span = info_span!(
            "job",
            job_id = %job.id,
            topic = %job.topic,
            rank = job.rank,
            attempt = job.attempt(),
        );
        self.tracker.spawn(
            execution::execute(self.env.clone(), processor, job, permit).instrument(span),
        );

        Tick::Dispatched
    }
}
