//! The manager: owns the store, the processor registry and the rank pools,
//! and drives the dispatch loop between `start` and `close`.

use crate::config::ManagerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{JobError, JobResult};
use crate::execution::ExecutionEnv;
use crate::job::{Job, JobContext, JobId, JobState};
use crate::memory::MemoryStore;
use crate::metrics::{register_metrics, JobMetrics};
use crate::processor::{FnProcessor, Processor, ProcessorRegistry};
use crate::rank::{RankPools, RankStats};
use crate::retry::RetryPolicy;
use crate::store::{ListRequest, ListResponse, StartupBehaviour, Stats, StatsRequest, Store};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

/// Lifecycle of a [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Built, dispatch loop not running yet.
    Created,
    /// Dispatching jobs.
    Started,
    /// Draining in-flight jobs.
    Stopping,
    /// Shut down. A stopped manager cannot be restarted.
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerState::Created => "created",
            ManagerState::Started => "started",
            ManagerState::Stopping => "stopping",
            ManagerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct Inner {
    store: Arc<dyn Store>,
    registry: Arc<ProcessorRegistry>,
    pools: Arc<RankPools>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    starting: AtomicBool,
    added: Arc<Notify>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Job manager.
///
/// Cheap to clone; all clones share the same queue.
///
/// # Example
///
/// ```rust,ignore
/// use jobqueue_core::{Job, Manager};
///
/// let manager = Manager::builder().concurrency(1, 10).build()?;
/// manager.register("email", |job, _ctx| async move {
///     send_email(&job.args).await
/// })?;
/// manager.start().await?;
///
/// manager.add(Job::new("email").with_rank(1).with_max_retry(3)).await?;
///
/// manager.close_with_timeout(Some(Duration::from_secs(30))).await?;
/// ```
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Create a builder.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Create a manager backed by an in-memory store with default settings.
    pub fn new() -> JobResult<Self> {
        Self::builder().build()
    }

    /// Register an async closure as the processor for `topic`.
    pub fn register<F, Fut>(&self, topic: impl Into<String>, f: F) -> JobResult<()>
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_processor(topic, Arc::new(FnProcessor::new(f)))
    }

    /// Register a [`Processor`] for `topic`.
    pub fn register_processor(
        &self,
        topic: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> JobResult<()> {
        self.inner.registry.register(topic, processor)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock()
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Reconcile interrupted jobs in the store, then start dispatching.
    ///
    /// Fails with `AlreadyStarted` unless the manager is freshly built. If
    /// the store fails to start, the manager stays `Created` and `start`
    /// may be called again. A manager closed while the store was starting
    /// stays closed and `start` returns `NotRunning`.
    pub async fn start(&self) -> JobResult<()> {
        if self.state() != ManagerState::Created || self.inner.starting.swap(true, Ordering::SeqCst)
        {
            return Err(JobError::AlreadyStarted);
        }

        if let Err(e) = self.inner.store.start(self.inner.config.startup_behaviour).await {
            self.inner.starting.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // A close() may have run while the store was starting.
        let mut state = self.inner.state.lock();
        if *state != ManagerState::Created || self.inner.cancel.is_cancelled() {
            self.inner.starting.store(false, Ordering::SeqCst);
            return Err(JobError::NotRunning);
        }

        let dispatcher = Dispatcher {
            env: self.execution_env(),
            registry: Arc::clone(&self.inner.registry),
            pools: Arc::clone(&self.inner.pools),
            tracker: self.inner.tracker.clone(),
            added: Arc::clone(&self.inner.added),
            poll_interval: self.inner.config.poll_interval(),
            saturation_backoff: self.inner.config.saturation_backoff(),
            store_error_backoff: self.inner.config.store_error_backoff(),
        };
        self.inner
            .tracker
            .spawn(dispatcher.run().instrument(info_span!("dispatch")));
        *state = ManagerState::Started;
        drop(state);

        info!(
            default_concurrency = self.inner.pools.default_limit(),
            ranks = ?self.inner.config.rank_concurrency,
            topics = ?self.inner.registry.topics(),
            "Job manager started"
        );

        Ok(())
    }

    fn execution_env(&self) -> ExecutionEnv {
        ExecutionEnv {
            store: Arc::clone(&self.inner.store),
            retry: self.inner.config.retry.clone(),
            cancel: self.inner.cancel.clone(),
        }
    }

    /// Submit a job.
    ///
    /// The topic must have a registered processor and the retry count may
    /// not exceed `max_retry`. A missing ID is generated; state, retry count
    /// and timestamps are reset to those of a new job. Returns the job as
    /// stored.
    pub async fn add(&self, mut job: Job) -> JobResult<Job> {
        if matches!(self.state(), ManagerState::Stopping | ManagerState::Stopped) {
            return Err(JobError::NotRunning);
        }
        if job.topic.trim().is_empty() {
            return Err(JobError::InvalidTopic(job.topic));
        }
        if !self.inner.registry.contains(&job.topic) {
            return Err(JobError::NoProcessor(job.topic));
        }

        if job.retry_count > job.max_retry {
            return Err(JobError::InvalidJob(format!(
                "retry_count {} exceeds max_retry {}",
                job.retry_count, job.max_retry
            )));
        }

        if job.id.is_empty() {
            job.id = JobId::new();
        }
        let now = Utc::now();
        job.state = JobState::Waiting;
        job.retry_count = 0;
        job.last_error = None;
        job.created_at = now;
        job.updated_at = now;
        job.started_at = None;
        job.completed_at = None;

        self.inner.store.create(&job).await?;

        JobMetrics::job_added(&job.topic, job.rank);
        debug!(
            job_id = %job.id,
            topic = %job.topic,
            rank = job.rank,
            priority = job.priority,
            "Job added"
        );
        self.inner.added.notify_one();

        Ok(job)
    }

    /// Job counts per state.
    pub async fn stats(&self, request: &StatsRequest) -> JobResult<Stats> {
        self.inner.store.stats(request).await
    }

    /// Occupancy of the rank pools.
    pub fn rank_stats(&self) -> Vec<RankStats> {
        self.inner.pools.snapshot()
    }

    /// Fetch a job by ID.
    pub async fn lookup(&self, id: &JobId) -> JobResult<Job> {
        self.inner.store.lookup(id).await
    }

    /// Fetch all jobs with a correlation ID.
    pub async fn lookup_by_correlation_id(&self, correlation_id: &str) -> JobResult<Vec<Job>> {
        self.inner.store.lookup_by_correlation_id(correlation_id).await
    }

    /// List jobs.
    pub async fn list(&self, request: &ListRequest) -> JobResult<ListResponse> {
        self.inner.store.list(request).await
    }

    /// Remove a job from the store.
    pub async fn delete(&self, id: &JobId) -> JobResult<()> {
        let job = self.inner.store.lookup(id).await?;
        if job.state == JobState::Working {
            warn!(job_id = %id, "Deleting a job that is currently executing");
        }
        self.inner.store.delete(&job).await?;
        debug!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Stop dispatching and wait for in-flight jobs without a deadline.
    pub async fn close(&self) -> JobResult<()> {
        self.close_with_timeout(None).await
    }

    /// Stop dispatching and wait for in-flight jobs using the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) -> JobResult<()> {
        self.close_with_timeout(self.inner.config.shutdown_timeout())
            .await
    }

    /// Stop dispatching, signal cancellation to running processors and wait
    /// up to `timeout` for them to finish (`None` waits indefinitely).
    ///
    /// On timeout returns `ShutdownTimeout`; the unfinished jobs stay
    /// `Working` in the store and are reconciled by the next `start`.
    pub async fn close_with_timeout(&self, timeout: Option<Duration>) -> JobResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ManagerState::Started => *state = ManagerState::Stopping,
                ManagerState::Created => {
                    *state = ManagerState::Stopped;
                    self.inner.cancel.cancel();
                    self.inner.tracker.close();
                    return Ok(());
                }
                ManagerState::Stopping | ManagerState::Stopped => {
                    return Err(JobError::NotRunning);
                }
            }
        }

        info!(timeout = ?timeout, "Closing job manager");
        self.inner.cancel.cancel();
        self.inner.tracker.close();

        let drained = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.tracker.wait())
                .await
                .is_ok(),
            None => {
                self.inner.tracker.wait().await;
                true
            }
        };

        *self.inner.state.lock() = ManagerState::Stopped;

        match timeout {
            Some(limit) if !drained => {
                warn!(
                    in_flight = self.inner.tracker.len(),
                    "Shutdown timed out, jobs left working"
                );
                Err(JobError::ShutdownTimeout(limit))
            }
            _ => {
                info!("Job manager stopped");
                Ok(())
            }
        }
    }
}

/// Builder for [`Manager`].
#[derive(Default)]
pub struct ManagerBuilder {
    store: Option<Arc<dyn Store>>,
    config: ManagerConfig,
}

impl ManagerBuilder {
    /// Create a builder with default configuration and an in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `store` for persistence.
    pub fn store<S: Store>(self, store: S) -> Self {
        self.shared_store(Arc::new(store))
    }

    /// Use an already shared store for persistence.
    pub fn shared_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the whole configuration. Later builder calls still apply.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the concurrency limit of one rank.
    pub fn concurrency(mut self, rank: u32, limit: usize) -> Self {
        self.config.rank_concurrency.insert(rank, limit);
        self
    }

    /// Set the concurrency limit of ranks without an explicit limit.
    pub fn default_concurrency(mut self, limit: usize) -> Self {
        self.config.default_concurrency = limit;
        self
    }

    /// Set how interrupted jobs are handled on start.
    pub fn startup_behaviour(mut self, behaviour: StartupBehaviour) -> Self {
        self.config.startup_behaviour = behaviour;
        self
    }

    /// Set the backoff applied before failed jobs are retried.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the manager. Fails with `Configuration` on invalid limits.
    pub fn build(self) -> JobResult<Manager> {
        self.config.validate()?;
        let pools = RankPools::new(self.config.default_concurrency, &self.config.rank_concurrency)?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);

        register_metrics();

        Ok(Manager {
            inner: Arc::new(Inner {
                store,
                registry: Arc::new(ProcessorRegistry::new()),
                pools: Arc::new(pools),
                config: self.config,
                state: Mutex::new(ManagerState::Created),
                starting: AtomicBool::new(false),
                added: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Manager {
        let manager = Manager::new().unwrap();
        manager
            .register("a", |_job: Job, _ctx: JobContext| async { anyhow::Ok(()) })
            .unwrap();
        manager
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let result = Manager::builder().concurrency(2, 0).build();
        assert!(matches!(result, Err(JobError::Configuration(_))));

        let result = Manager::builder().default_concurrency(0).build();
        assert!(matches!(result, Err(JobError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_add_assigns_defaults() {
        let manager = manager();
        let mut job = Job::new("a").with_id("").with_max_retry(3);
        job.retry_count = 2;
        job.state = JobState::Failed;

        let stored = manager.add(job).await.unwrap();

        assert!(!stored.id.is_empty());
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(manager.lookup(&stored.id).await.unwrap().max_retry, 3);
    }

    #[tokio::test]
    async fn test_add_rejects_unregistered_topic() {
        let manager = manager();
        assert!(matches!(
            manager.add(Job::new("unknown")).await,
            Err(JobError::NoProcessor(_))
        ));
        assert!(matches!(
            manager.add(Job::new(" ")).await,
            Err(JobError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_retry_count_over_budget() {
        let manager = manager();
        let mut job = Job::new("a").with_max_retry(1);
        job.retry_count = 3;

        assert!(matches!(
            manager.add(job).await,
            Err(JobError::InvalidJob(_))
        ));
        assert_eq!(manager.stats(&StatsRequest::default()).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let manager = manager();
        manager.add(Job::new("a").with_id("fixed")).await.unwrap();
        assert!(matches!(
            manager.add(Job::new("a").with_id("fixed")).await,
            Err(JobError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let manager = manager();
        assert_eq!(manager.state(), ManagerState::Created);

        manager.start().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Started);
        assert!(matches!(manager.start().await, Err(JobError::AlreadyStarted)));

        manager.close().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(matches!(manager.close().await, Err(JobError::NotRunning)));
        assert!(matches!(manager.start().await, Err(JobError::AlreadyStarted)));
        assert!(matches!(
            manager.add(Job::new("a")).await,
            Err(JobError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let manager = manager();
        manager.close().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_delete() {
        let manager = manager();
        let job = manager.add(Job::new("a")).await.unwrap();

        manager.delete(&job.id).await.unwrap();
        assert!(manager.lookup(&job.id).await.unwrap_err().is_not_found());
        assert!(manager.delete(&job.id).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ManagerState::Stopping.to_string(), "stopping");
    }
}
