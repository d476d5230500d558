//! Topic processors and their registry.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Executes jobs of one topic.
///
/// Implementations may be invoked concurrently for different jobs, up to
/// the concurrency limit of each rank. Returning an error (or panicking)
/// consumes one retry of the job.
///
/// # Example
///
/// ```rust,ignore
/// use jobqueue_core::{Job, JobContext, Processor};
///
/// struct Resize;
///
/// #[async_trait::async_trait]
/// impl Processor for Resize {
///     async fn process(&self, job: Job, _ctx: JobContext) -> anyhow::Result<()> {
///         let width = job.args["width"].as_u64().unwrap_or(800);
///         resize_image(width).await
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Process one attempt of `job`.
    async fn process(&self, job: Job, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Processor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, job: Job, ctx: JobContext) -> anyhow::Result<()> {
        (self.f)(job, ctx).await
    }
}

/// Maps topics to processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `topic`.
    ///
    /// Fails with `InvalidTopic` for a blank topic and `DuplicateTopic` if
    /// the topic already has a processor.
    pub fn register(&self, topic: impl Into<String>, processor: Arc<dyn Processor>) -> JobResult<()> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(JobError::InvalidTopic(topic));
        }

        let mut processors = self.processors.write();
        if processors.contains_key(&topic) {
            return Err(JobError::DuplicateTopic(topic));
        }
        processors.insert(topic.clone(), processor);
        drop(processors);

        info!(topic = %topic, "Registered processor");
        Ok(())
    }

    /// Processor registered for `topic`.
    pub fn lookup(&self, topic: &str) -> JobResult<Arc<dyn Processor>> {
        self.processors
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| JobError::NoProcessor(topic.to_string()))
    }

    /// Returns true if `topic` has a processor.
    pub fn contains(&self, topic: &str) -> bool {
        self.processors.read().contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.processors.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.processors.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
