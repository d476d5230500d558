//! In-memory store, used when no persistent backend is configured.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState};
use crate::store::{
    ListRequest, ListResponse, NextRequest, StartupBehaviour, Stats, StatsRequest, Store,
    INTERRUPTED_JOB_ERROR,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Ordering key of a waiting job: highest priority, then oldest, then
/// insertion order.
type WaitingKey = (Reverse<i64>, DateTime<Utc>, u64);

struct Entry {
    job: Job,
    seq: u64,
}

impl Entry {
    fn waiting_key(&self) -> WaitingKey {
        (Reverse(self.job.priority), self.job.created_at, self.seq)
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    waiting: BTreeMap<WaitingKey, JobId>,
    next_seq: u64,
}

impl Inner {
    fn index(&mut self, id: &JobId) {
        if let Some(entry) = self.jobs.get(id) {
            if entry.job.state == JobState::Waiting {
                self.waiting.insert(entry.waiting_key(), id.clone());
            }
        }
    }

    fn unindex(&mut self, id: &JobId) {
        if let Some(entry) = self.jobs.get(id) {
            self.waiting.remove(&entry.waiting_key());
        }
    }
}

/// Process-local store. Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held, in any state.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns true if the store holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn start(&self, behaviour: StartupBehaviour) -> JobResult<()> {
        let mut inner = self.inner.lock();

        let interrupted: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Working)
            .map(|e| e.job.id.clone())
            .collect();

        for id in &interrupted {
            if let Some(entry) = inner.jobs.get_mut(id) {
                match behaviour {
                    StartupBehaviour::Requeue => entry.job.requeue(),
                    StartupBehaviour::MarkAsFailed => entry.job.mark_failed(INTERRUPTED_JOB_ERROR),
                }
            }
            inner.index(id);
        }

        if !interrupted.is_empty() {
            info!(count = interrupted.len(), ?behaviour, "Reconciled interrupted jobs");
        }

        Ok(())
    }

    async fn create(&self, job: &Job) -> JobResult<()> {
        let mut inner = self.inner.lock();

        if inner.jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateJob(job.id.to_string()));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id.clone(),
            Entry {
                job: job.clone(),
                seq,
            },
        );
        inner.index(&job.id);

        debug!(job_id = %job.id, topic = %job.topic, "Stored job");
        Ok(())
    }

    async fn update(&self, job: &Job) -> JobResult<()> {
        let mut inner = self.inner.lock();

        if !inner.jobs.contains_key(&job.id) {
            return Err(JobError::NotFound(job.id.to_string()));
        }

        inner.unindex(&job.id);
        if let Some(entry) = inner.jobs.get_mut(&job.id) {
            entry.job = job.clone();
        }
        inner.index(&job.id);

        Ok(())
    }

    async fn delete(&self, job: &Job) -> JobResult<()> {
        let mut inner = self.inner.lock();

        inner.unindex(&job.id);
        match inner.jobs.remove(&job.id) {
            Some(_) => Ok(()),
            None => Err(JobError::NotFound(job.id.to_string())),
        }
    }

    async fn next(&self, request: &NextRequest) -> JobResult<Option<Job>> {
        let mut inner = self.inner.lock();

        let picked = inner
            .waiting
            .iter()
            .find(|(_, id)| {
                inner
                    .jobs
                    .get(*id)
                    .is_some_and(|e| request.allows(e.job.rank))
            })
            .map(|(key, id)| (*key, id.clone()));

        let Some((key, id)) = picked else {
            return Ok(None);
        };

        inner.waiting.remove(&key);
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        entry.job.mark_working();

        Ok(Some(entry.job.clone()))
    }

    async fn stats(&self, request: &StatsRequest) -> JobResult<Stats> {
        let inner = self.inner.lock();

        let mut stats = Stats::default();
        for entry in inner.jobs.values().filter(|e| request.matches(&e.job)) {
            stats.record(entry.job.state);
        }

        Ok(stats)
    }

    async fn lookup(&self, id: &JobId) -> JobResult<Job> {
        self.inner
            .lock()
            .jobs
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    async fn lookup_by_correlation_id(&self, correlation_id: &str) -> JobResult<Vec<Job>> {
        let inner = self.inner.lock();

        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| e.job.correlation_id.as_deref() == Some(correlation_id))
            .collect();
        entries.sort_by_key(|e| e.seq);

        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }

    async fn list(&self, request: &ListRequest) -> JobResult<ListResponse> {
        let inner = self.inner.lock();

        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| request.matches(&e.job))
            .collect();
        // Newest first, matching the relational backend.
        entries.sort_by_key(|e| Reverse((e.job.created_at, e.seq)));

        let total = entries.len() as u64;
        let limit = if request.limit == 0 {
            usize::MAX
        } else {
            request.limit
        };

        let jobs = entries
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .map(|e| e.job.clone())
            .collect();

        Ok(ListResponse { total, jobs })
    }
}
