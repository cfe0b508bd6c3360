//! SQLite-backed durable job queue.
//!
//! Implements the `JobQueue` insert port from `sagaflow-core` plus the
//! fetch/complete/retry/discard operations the worker pool drives. Jobs are
//! claimed with a single `UPDATE ... RETURNING` on the writer connection, so
//! one job is never handed to two workers at once.
//!
//! Delivery is at-least-once: a worker that dies mid-job leaves the row in
//! `running` until `rescue_stuck` hands it back.

use chrono::{DateTime, Utc};
use sagaflow_core::queue::JobQueue;
use sagaflow_types::error::QueueError;
use sagaflow_types::job::{InsertOpts, JobFilter, JobId, JobRecord, JobState, StepJob};
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_status};

/// Error recorded on jobs handed back by `rescue_stuck`.
pub const RESCUE_ERROR: &str = "job rescued after exceeding its running time";

/// Jobs touched by one `rescue_stuck` pass.
#[derive(Debug, Default)]
pub struct RescueReport {
    /// Jobs made retryable again.
    pub retried: u64,
    /// Jobs finalized because they had no attempts left.
    pub discarded: Vec<JobRecord>,
}

impl RescueReport {
    pub fn total(&self) -> u64 {
        self.retried + self.discarded.len() as u64
    }
}

/// SQLite implementation of the job queue.
pub struct SqliteJobQueue {
    pool: DatabasePool,
}

impl SqliteJobQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct JobRow {
    id: i64,
    kind: String,
    queue: String,
    priority: i64,
    payload: String,
    state: String,
    attempt: i64,
    max_attempts: i64,
    scheduled_at: String,
    attempted_at: Option<String>,
    finalized_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempted_at: row.try_get("attempted_at")?,
            finalized_at: row.try_get("finalized_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, QueueError> {
        let storage = |e: sagaflow_types::error::RepositoryError| QueueError::Storage(e.to_string());
        Ok(JobRecord {
            id: self.id,
            kind: self.kind,
            queue: self.queue,
            priority: i16::try_from(self.priority).unwrap_or(i16::MAX),
            payload: parse_json(&self.payload, "job payload").map_err(storage)?,
            state: parse_status::<JobState>(&self.state, "job state").map_err(storage)?,
            attempt: self.attempt.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            scheduled_at: parse_datetime(&self.scheduled_at).map_err(storage)?,
            attempted_at: self
                .attempted_at
                .as_deref()
                .map(parse_datetime)
                .transpose()
                .map_err(storage)?,
            finalized_at: self
                .finalized_at
                .as_deref()
                .map(parse_datetime)
                .transpose()
                .map_err(storage)?,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at).map_err(storage)?,
        })
    }
}

fn record_from(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, QueueError> {
    JobRow::from_row(row)
        .map_err(|e| QueueError::Storage(e.to_string()))?
        .into_record()
}

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

impl SqliteJobQueue {
    /// Claim up to `limit` jobs from `queue` scheduled at or before `due_by`,
    /// highest priority first.
    ///
    /// Claimed jobs move to `running` with their attempt counter incremented.
    pub async fn fetch_available(
        &self,
        queue: &str,
        limit: u32,
        due_by: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"UPDATE jobs
               SET state = 'running', attempt = attempt + 1, attempted_at = ?
               WHERE id IN (
                   SELECT id FROM jobs
                   WHERE queue = ?
                     AND state IN ('available', 'retryable')
                     AND scheduled_at <= ?
                   ORDER BY priority ASC, scheduled_at ASC, id ASC
                   LIMIT ?
               )
               RETURNING *"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(queue)
        .bind(format_datetime(&due_by))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        let mut jobs = rows.iter().map(record_from).collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order
        jobs.sort_by(|a, b| {
            (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
        });
        Ok(jobs)
    }

    /// Mark a job as successfully finished.
    pub async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        self.finalize(id, JobState::Completed, None).await
    }

    /// Finalize a job without further attempts.
    pub async fn discard(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        self.finalize(id, JobState::Discarded, Some(error)).await
    }

    /// Schedule another attempt of a job at `at`.
    pub async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'retryable', scheduled_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(format_datetime(&at))
        .bind(error)
        .bind(id)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn finalize(&self, id: JobId, state: JobState, error: Option<&str>) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, finalized_at = ?, last_error = COALESCE(?, last_error) WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(error)
        .bind(id)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Hand jobs stuck in `running` since before `older_than` back to the
    /// queue, or discard them when no attempts remain.
    pub async fn rescue_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> Result<RescueReport, QueueError> {
        let now = format_datetime(&now);
        let rows = sqlx::query(
            r#"UPDATE jobs
               SET state = CASE WHEN attempt < max_attempts THEN 'retryable' ELSE 'discarded' END,
                   scheduled_at = ?,
                   finalized_at = CASE WHEN attempt < max_attempts THEN NULL ELSE ? END,
                   last_error = ?
               WHERE state = 'running' AND attempted_at < ?
               RETURNING *"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(RESCUE_ERROR)
        .bind(format_datetime(&older_than))
        .fetch_all(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        let mut report = RescueReport::default();
        for row in &rows {
            let job = record_from(row)?;
            if job.state == JobState::Discarded {
                report.discarded.push(job);
            } else {
                report.retried += 1;
            }
        }
        Ok(report)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        row.as_ref().map(record_from).transpose()
    }

    /// List jobs, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1 = 1");
        if filter.queue.is_some() {
            sql.push_str(" AND queue = ?");
        }
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(queue) = &filter.queue {
            query = query.bind(queue);
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        let limit = if filter.limit == 0 { -1 } else { i64::from(filter.limit) };

        let rows = query
            .bind(limit)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        rows.iter().map(record_from).collect()
    }
}

impl JobQueue for SqliteJobQueue {
    async fn insert(&self, job: &StepJob, opts: &InsertOpts) -> Result<JobId, QueueError> {
        let payload = serde_json::to_string(job).map_err(|e| QueueError::Payload(e.to_string()))?;
        let now = Utc::now();
        let scheduled_at = opts.scheduled_at.unwrap_or(now);

        let result = sqlx::query(
            r#"INSERT INTO jobs (kind, queue, priority, payload, state, attempt, max_attempts, scheduled_at, created_at)
               VALUES (?, ?, ?, ?, 'available', 0, ?, ?, ?)"#,
        )
        .bind(StepJob::KIND)
        .bind(&opts.queue)
        .bind(i64::from(opts.priority))
        .bind(&payload)
        .bind(i64::from(opts.max_attempts.max(1)))
        .bind(format_datetime(&scheduled_at))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        Ok(result.last_insert_rowid())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use chrono::Duration;
    use serde_json::{Map, Value};
    use uuid::Uuid;

    fn step_job(step: &str) -> StepJob {
        StepJob {
            workflow_id: Uuid::now_v7(),
            workflow_type: "user_signup".to_string(),
            step_name: step.to_string(),
            org_id: None,
            user_id: None,
            workflow_input: Map::new(),
            step_input: Value::Null,
        }
    }

    fn opts(queue: &str, priority: i16, max_attempts: u32) -> InsertOpts {
        InsertOpts {
            queue: queue.to_string(),
            priority,
            max_attempts,
            scheduled_at: None,
        }
    }

    async fn test_queue() -> SqliteJobQueue {
        SqliteJobQueue::new(test_pool().await)
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let queue = test_queue().await;
        let id = queue.insert(&step_job("validate"), &opts("default", 1, 3)).await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Available);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.kind, StepJob::KIND);
        assert_eq!(job.step_job().unwrap().step_name, "validate");

        let fetched = queue.fetch_available("default", 10, Utc::now()).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, id);
        assert_eq!(fetched[0].state, JobState::Running);
        assert_eq!(fetched[0].attempt, 1);
        assert!(fetched[0].attempted_at.is_some());

        // Claimed jobs are not handed out twice
        assert!(queue.fetch_available("default", 10, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_respects_queue_priority_and_limit() {
        let queue = test_queue().await;
        let low = queue.insert(&step_job("a"), &opts("default", 3, 1)).await.unwrap();
        let high = queue.insert(&step_job("b"), &opts("default", 1, 1)).await.unwrap();
        queue.insert(&step_job("c"), &opts("external", 1, 1)).await.unwrap();

        let first = queue.fetch_available("default", 1, Utc::now()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, high);

        let rest = queue.fetch_available("default", 10, Utc::now()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, low);
    }

    #[tokio::test]
    async fn test_scheduled_jobs_wait_until_due() {
        let queue = test_queue().await;
        let mut delayed = opts("default", 1, 1);
        delayed.scheduled_at = Some(Utc::now() + Duration::minutes(5));
        queue.insert(&step_job("later"), &delayed).await.unwrap();

        assert!(queue.fetch_available("default", 10, Utc::now()).await.unwrap().is_empty());
        let due = queue
            .fetch_available("default", 10, Utc::now() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_complete() {
        let queue = test_queue().await;
        let id = queue.insert(&step_job("create_user"), &opts("default", 1, 3)).await.unwrap();
        queue.fetch_available("default", 1, Utc::now()).await.unwrap();

        let at = Utc::now() + Duration::seconds(30);
        queue.retry(id, at, "database is locked").await.unwrap();
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retryable);
        assert_eq!(job.last_error.as_deref(), Some("database is locked"));
        assert!(queue.fetch_available("default", 1, Utc::now()).await.unwrap().is_empty());

        let again = queue.fetch_available("default", 1, at).await.unwrap();
        assert_eq!(again[0].attempt, 2);

        queue.complete(id).await.unwrap();
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finalized_at.is_some());
        assert!(job.state.is_finalized());
    }

    #[tokio::test]
    async fn test_discard_and_missing_job() {
        let queue = test_queue().await;
        let id = queue.insert(&step_job("validate"), &opts("default", 1, 1)).await.unwrap();
        queue.discard(id, "validation failed").await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.last_error.as_deref(), Some("validation failed"));

        assert!(matches!(queue.complete(9_999).await, Err(QueueError::NotFound(9_999))));
    }

    #[tokio::test]
    async fn test_rescue_stuck_jobs() {
        let queue = test_queue().await;
        let retryable = queue.insert(&step_job("a"), &opts("default", 1, 2)).await.unwrap();
        let exhausted = queue.insert(&step_job("b"), &opts("default", 1, 1)).await.unwrap();
        queue.fetch_available("default", 10, Utc::now()).await.unwrap();

        let untouched = queue
            .rescue_stuck(Utc::now() - Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(untouched.total(), 0);

        let rescued = queue
            .rescue_stuck(Utc::now() + Duration::seconds(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(rescued.total(), 2);
        assert_eq!(rescued.retried, 1);
        assert_eq!(rescued.discarded.len(), 1);
        assert_eq!(rescued.discarded[0].id, exhausted);
        assert_eq!(rescued.discarded[0].step_job().unwrap().step_name, "b");
        assert_eq!(rescued.discarded[0].last_error.as_deref(), Some(RESCUE_ERROR));
        assert_eq!(queue.get_job(retryable).await.unwrap().unwrap().state, JobState::Retryable);
        assert_eq!(queue.get_job(exhausted).await.unwrap().unwrap().state, JobState::Discarded);
    }

    #[tokio::test]
    async fn test_list_jobs_filters() {
        let queue = test_queue().await;
        let a = queue.insert(&step_job("a"), &opts("default", 1, 1)).await.unwrap();
        let b = queue.insert(&step_job("b"), &opts("external", 1, 1)).await.unwrap();
        queue.complete(a).await.unwrap();

        let all = queue.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b, a]);

        let external = queue
            .list_jobs(&JobFilter {
                queue: Some("external".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].id, b);

        let completed = queue
            .list_jobs(&JobFilter {
                state: Some(JobState::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, a);
    }
}
