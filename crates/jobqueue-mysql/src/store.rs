//! MySQL job store implementation.

use crate::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_core::{
    Job, JobError, JobId, JobResult, JobState, ListRequest, ListResponse, NextRequest,
    StartupBehaviour, Stats, StatsRequest, Store, INTERRUPTED_JOB_ERROR,
};
use sqlx::{FromRow, MySql, QueryBuilder};
use std::sync::Arc;
use tracing::{debug, info};

const JOB_COLUMNS: &str = "id, topic, state, args, job_rank, priority, retry_count, max_retry, \
     correlation_id, correlation_group, last_error, created_at, updated_at, started_at, \
     completed_at";

/// MySQL-backed [`Store`]. Jobs survive restarts and may be shared by
/// several manager processes.
#[derive(Clone, Debug)]
pub struct MySqlStore {
    pool: Arc<DatabasePool>,
}

impl MySqlStore {
    /// Creates a new MySQL job store.
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }
}

/// Database row representation of a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    topic: String,
    state: String,
    args: String,
    job_rank: u32,
    priority: i64,
    retry_count: u32,
    max_retry: u32,
    correlation_id: Option<String>,
    correlation_group: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| JobError::Store(format!("Invalid state in database: {}", e)))?;

        Ok(Job {
            id: JobId::from_string(row.id),
            topic: row.topic,
            state,
            args: serde_json::from_str(&row.args)?,
            rank: row.job_rank,
            priority: row.priority,
            retry_count: row.retry_count,
            max_retry: row.max_retry,
            correlation_id: row.correlation_id,
            correlation_group: row.correlation_group,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn db_error(err: sqlx::Error) -> JobError {
    JobError::Store(err.to_string())
}

fn select_jobs<'a>() -> QueryBuilder<'a, MySql> {
    QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"))
}

fn push_filters<'a>(
    qb: &mut QueryBuilder<'a, MySql>,
    topic: Option<&'a str>,
    correlation_group: Option<&'a str>,
) {
    if let Some(topic) = topic {
        qb.push(" AND topic = ").push_bind(topic);
    }
    if let Some(group) = correlation_group {
        qb.push(" AND correlation_group = ").push_bind(group);
    }
}

fn push_list_filters<'a>(qb: &mut QueryBuilder<'a, MySql>, request: &'a ListRequest) {
    push_filters(
        qb,
        request.topic.as_deref(),
        request.correlation_group.as_deref(),
    );
    if let Some(cid) = request.correlation_id.as_deref() {
        qb.push(" AND correlation_id = ").push_bind(cid);
    }
    if let Some(state) = request.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn start(&self, behaviour: StartupBehaviour) -> JobResult<()> {
        let now = Utc::now();

        let result = match behaviour {
            StartupBehaviour::Requeue => {
                sqlx::query(
                    "UPDATE jobs SET state = ?, started_at = NULL, updated_at = ? WHERE state = ?",
                )
                .bind(JobState::Waiting.as_str())
                .bind(now)
                .bind(JobState::Working.as_str())
                .execute(self.pool.inner())
                .await
            }
            StartupBehaviour::MarkAsFailed => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = ?, last_error = ?, updated_at = ?, completed_at = ?
                    WHERE state = ?
                    "#,
                )
                .bind(JobState::Failed.as_str())
                .bind(INTERRUPTED_JOB_ERROR)
                .bind(now)
                .bind(now)
                .bind(JobState::Working.as_str())
                .execute(self.pool.inner())
                .await
            }
        }
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            info!(
                count = result.rows_affected(),
                ?behaviour,
                "Reconciled interrupted jobs"
            );
        }

        Ok(())
    }

    async fn create(&self, job: &Job) -> JobResult<()> {
        debug!(job_id = %job.id, topic = %job.topic, "Inserting job");

        let args = serde_json::to_string(&job.args)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, topic, state, args, job_rank, priority, retry_count,
                              max_retry, correlation_id, correlation_group, last_error,
                              created_at, updated_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.topic)
        .bind(job.state.as_str())
        .bind(args)
        .bind(job.rank)
        .bind(job.priority)
        .bind(job.retry_count)
        .bind(job.max_retry)
        .bind(&job.correlation_id)
        .bind(&job.correlation_group)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(self.pool.inner())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                JobError::DuplicateJob(job.id.to_string())
            }
            other => db_error(other),
        })?;

        Ok(())
    }

    async fn update(&self, job: &Job) -> JobResult<()> {
        debug!(job_id = %job.id, state = %job.state, "Updating job");

        let args = serde_json::to_string(&job.args)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, args = ?, priority = ?, retry_count = ?, max_retry = ?,
                correlation_id = ?, correlation_group = ?, last_error = ?,
                updated_at = ?, started_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(args)
        .bind(job.priority)
        .bind(job.retry_count)
        .bind(job.max_retry)
        .bind(&job.correlation_id)
        .bind(&job.correlation_group)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.id.as_str())
        .execute(self.pool.inner())
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            // MySQL reports zero affected rows for no-op updates too.
            let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ? LIMIT 1")
                .bind(job.id.as_str())
                .fetch_optional(self.pool.inner())
                .await
                .map_err(db_error)?;
            if exists.is_none() {
                return Err(JobError::NotFound(job.id.to_string()));
            }
        }

        Ok(())
    }

    async fn delete(&self, job: &Job) -> JobResult<()> {
        debug!(job_id = %job.id, "Deleting job");

        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job.id.as_str())
            .execute(self.pool.inner())
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(job.id.to_string()));
        }
        Ok(())
    }

    async fn next(&self, request: &NextRequest) -> JobResult<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let mut qb = select_jobs();
        qb.push(" AND state = ").push_bind(JobState::Waiting.as_str());
        if !request.exclude_ranks.is_empty() {
            qb.push(" AND job_rank NOT IN (");
            let mut ranks = qb.separated(", ");
            for rank in &request.exclude_ranks {
                ranks.push_bind(*rank);
            }
            ranks.push_unseparated(")");
        }
        qb.push(" ORDER BY priority DESC, created_at ASC, seq ASC LIMIT 1 FOR UPDATE SKIP LOCKED");

        let Some(row) = qb
            .build_query_as::<JobRow>()
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
        else {
            tx.commit().await.map_err(db_error)?;
            return Ok(None);
        };

        let mut job = Job::try_from(row)?;
        job.mark_working();

        sqlx::query("UPDATE jobs SET state = ?, started_at = ?, updated_at = ? WHERE id = ?")
            .bind(job.state.as_str())
            .bind(job.started_at)
            .bind(job.updated_at)
            .bind(job.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(job_id = %job.id, rank = job.rank, "Picked job");
        Ok(Some(job))
    }

    async fn stats(&self, request: &StatsRequest) -> JobResult<Stats> {
        let mut qb = QueryBuilder::<MySql>::new("SELECT state, COUNT(*) FROM jobs WHERE 1 = 1");
        push_filters(
            &mut qb,
            request.topic.as_deref(),
            request.correlation_group.as_deref(),
        );
        qb.push(" GROUP BY state");

        let rows = qb
            .build_query_as::<(String, i64)>()
            .fetch_all(self.pool.inner())
            .await
            .map_err(db_error)?;

        let mut stats = Stats::default();
        for (state, count) in rows {
            let state = state
                .parse::<JobState>()
                .map_err(|e| JobError::Store(format!("Invalid state in database: {}", e)))?;
            stats.add(state, u64::try_from(count).unwrap_or(0));
        }

        Ok(stats)
    }

    async fn lookup(&self, id: &JobId) -> JobResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool.inner())
        .await
        .map_err(db_error)?;

        row.ok_or_else(|| JobError::NotFound(id.to_string()))
            .and_then(Job::try_from)
    }

    async fn lookup_by_correlation_id(&self, correlation_id: &str) -> JobResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE correlation_id = ? ORDER BY seq ASC"
        ))
        .bind(correlation_id)
        .fetch_all(self.pool.inner())
        .await
        .map_err(db_error)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn list(&self, request: &ListRequest) -> JobResult<ListResponse> {
        let mut count = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
        push_list_filters(&mut count, request);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(self.pool.inner())
            .await
            .map_err(db_error)?;

        let limit = if request.limit == 0 {
            u64::MAX
        } else {
            request.limit as u64
        };

        let mut qb = select_jobs();
        push_list_filters(&mut qb, request);
        qb.push(" ORDER BY created_at DESC, seq DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(request.offset as u64);

        let rows = qb
            .build_query_as::<JobRow>()
            .fetch_all(self.pool.inner())
            .await
            .map_err(db_error)?;

        Ok(ListResponse {
            total: u64::try_from(total).unwrap_or(0),
            jobs: rows
                .into_iter()
                .map(Job::try_from)
                .collect::<JobResult<Vec<_>>>()?,
        })
    }
}
