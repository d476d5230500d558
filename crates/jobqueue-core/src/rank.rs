//! Per-rank concurrency pools.
//!
//! Each rank owns a semaphore sized to its limit. A [`RankPermit`] is the
//! only way to occupy a slot and the slot is released when the permit is
//! dropped, so capacity cannot leak on any exit path of an execution.

use crate::error::{JobError, JobResult};
use crate::metrics::RankMetrics;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Occupancy of a single rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankStats {
    /// Rank.
    pub rank: u32,

    /// Maximum concurrent executions.
    pub limit: usize,

    /// Executions currently holding a slot.
    pub in_flight: usize,
}

struct RankPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl RankPool {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}

/// Capacity tracking for every rank.
pub struct RankPools {
    default_limit: usize,
    pools: RwLock<HashMap<u32, RankPool>>,
    released: Arc<Notify>,
}

impl RankPools {
    /// Create pools with explicit per-rank limits. Ranks not listed get
    /// `default_limit`. Zero limits are rejected because they would starve
    /// the rank forever.
    pub fn new(default_limit: usize, limits: &BTreeMap<u32, usize>) -> JobResult<Self> {
        if default_limit == 0 {
            return Err(JobError::Configuration(
                "default rank concurrency must be at least 1".to_string(),
            ));
        }
        if let Some((rank, _)) = limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(JobError::Configuration(format!(
                "concurrency for rank {rank} must be at least 1"
            )));
        }

        let pools = limits
            .iter()
            .map(|(rank, limit)| (*rank, RankPool::new(*limit)))
            .collect();

        Ok(Self {
            default_limit,
            pools: RwLock::new(pools),
            released: Arc::new(Notify::new()),
        })
    }

    /// Limit applied to ranks without explicit configuration.
    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Configured or default limit for `rank`.
    pub fn limit(&self, rank: u32) -> usize {
        self.pools
            .read()
            .get(&rank)
            .map_or(self.default_limit, |p| p.limit)
    }

    /// Executions currently holding a slot of `rank`.
    pub fn in_flight(&self, rank: u32) -> usize {
        self.pools.read().get(&rank).map_or(0, RankPool::in_flight)
    }

    /// Take a slot of `rank` if one is free.
    pub fn try_acquire(&self, rank: u32) -> Option<RankPermit> {
        let existing = {
            let pools = self.pools.read();
            pools.get(&rank).map(|p| (p.limit, Arc::clone(&p.semaphore)))
        };
        let (limit, semaphore) = match existing {
            Some(existing) => existing,
            None => {
                let mut pools = self.pools.write();
                let pool = pools
                    .entry(rank)
                    .or_insert_with(|| RankPool::new(self.default_limit));
                (pool.limit, Arc::clone(&pool.semaphore))
            }
        };

        let permit = Arc::clone(&semaphore).try_acquire_owned().ok()?;
        RankMetrics::update_in_flight(rank, limit - semaphore.available_permits());

        Some(RankPermit {
            rank,
            limit,
            permit: Some(permit),
            released: Arc::clone(&self.released),
            semaphore,
        })
    }

    /// Ranks with no free slot.
    pub fn saturated_ranks(&self) -> BTreeSet<u32> {
        self.pools
            .read()
            .iter()
            .filter(|(_, pool)| pool.semaphore.available_permits() == 0)
            .map(|(rank, _)| *rank)
            .collect()
    }

    /// Occupancy of every rank seen so far, ordered by rank.
    pub fn snapshot(&self) -> Vec<RankStats> {
        let pools = self.pools.read();
        let mut stats: Vec<RankStats> = pools
            .iter()
            .map(|(rank, pool)| RankStats {
                rank: *rank,
                limit: pool.limit,
                in_flight: pool.in_flight(),
            })
            .collect();
        stats.sort_by_key(|s| s.rank);
        stats
    }

    /// Notified whenever a slot is released.
    pub(crate) fn released(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }
}

/// An occupied slot of a rank pool. Dropping it releases the slot and
/// wakes the dispatcher.
pub struct RankPermit {
    rank: u32,
    limit: usize,
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
    semaphore: Arc<Semaphore>,
}

impl RankPermit {
    /// Rank this permit belongs to.
    pub fn rank(&self) -> u32 {
        self.rank
    }
}

impl std::fmt::Debug for RankPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankPermit").field("rank", &self.rank).finish()
    }
}

impl Drop for RankPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            let in_flight = self.limit - self.semaphore.available_permits();
            RankMetrics::update_in_flight(self.rank, in_flight);
        }
        self.released.notify_one();
    }
}
