//! Jobqueue Core - persistent, topic-based job queue
//!
//! Producers submit jobs tagged with a topic, a rank and a priority. A
//! [`Manager`] dispatches each job to the processor registered for its
//! topic while never running more jobs of a rank than the rank allows, and
//! records every outcome in a [`Store`]:
//!
//! - Per-rank concurrency pools (default one job at a time per rank)
//! - Priority ordering, oldest first within a priority
//! - Per-job retry budget with optional backoff
//! - Processor errors and panics recorded on the job, never lost
//! - Bounded drain on shutdown, interrupted jobs reconciled on start
//!
//! # Architecture
//!
//! ```text
//!   add() ──► Store ◄── next(exclude saturated ranks) ── Dispatch loop
//!               ▲                                            │
//!               │                                  try_acquire(rank)
//!               │                                            ▼
//!               └──── update(outcome) ◄── Execution task (processor)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobqueue_core::prelude::*;
//!
//! let manager = Manager::builder()
//!     .concurrency(0, 1)
//!     .concurrency(1, 10)
//!     .build()?;
//!
//! manager.register("thumbnail", |job, ctx| async move {
//!     tracing::info!(attempt = ctx.attempt, "Rendering {}", job.args["path"]);
//!     Ok(())
//! })?;
//!
//! manager.start().await?;
//! manager
//!     .add(Job::new("thumbnail").with_rank(1).with_max_retry(3))
//!     .await?;
//!
//! let stats = manager.stats(&StatsRequest::default()).await?;
//! manager.close_with_timeout(Some(Duration::from_secs(10))).await?;
//! ```

pub mod config;
mod dispatch;
pub mod error;
mod execution;
pub mod job;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod processor;
pub mod rank;
pub mod retry;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::ManagerConfig;
pub use error::{JobError, JobResult};
pub use job::{Job, JobContext, JobId, JobState};
pub use manager::{Manager, ManagerBuilder, ManagerState};
pub use memory::MemoryStore;
pub use processor::{FnProcessor, Processor, ProcessorRegistry};
pub use rank::{RankPermit, RankPools, RankStats};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{
    ListRequest, ListResponse, NextRequest, StartupBehaviour, Stats, StatsRequest, Store,
    INTERRUPTED_JOB_ERROR,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::ManagerConfig;
    pub use crate::error::{JobError, JobResult};
    pub use crate::job::{Job, JobContext, JobId, JobState};
    pub use crate::manager::Manager;
    pub use crate::processor::Processor;
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{ListRequest, StartupBehaviour, Stats, StatsRequest, Store};
    pub use std::time::Duration;
}
