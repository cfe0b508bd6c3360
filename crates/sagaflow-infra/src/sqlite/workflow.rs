//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `sagaflow-core` using sqlx with split
//! read/write pools. Contexts and step payloads are stored as JSON text.
//! Start-request dedup is enforced by the partial unique index
//! `ux_workflow_executions_active`, so two concurrent inserts for the same
//! key cannot both produce an active row.

use chrono::{DateTime, Utc};
use sagaflow_core::repository::workflow::WorkflowRepository;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::{
    AdvanceState, ExecutionFilter, InsertOutcome, NewExecution, StepStatus, WorkflowExecution,
    WorkflowStatus, WorkflowStep, merge_context,
};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_status, parse_uuid, placeholders};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    workflow_id: String,
    workflow_type: String,
    org_id: Option<String>,
    user_id: Option<String>,
    status: String,
    current_step: Option<String>,
    context: String,
    args_hash: String,
    pending_branches: i64,
    started_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            workflow_type: row.try_get("workflow_type")?,
            org_id: row.try_get("org_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            context: row.try_get("context")?,
            args_hash: row.try_get("args_hash")?,
            pending_branches: row.try_get("pending_branches")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        Ok(WorkflowExecution {
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_type: self.workflow_type,
            org_id: self.org_id,
            user_id: self.user_id,
            status: parse_status(&self.status, "workflow status")?,
            current_step: self.current_step,
            context: parse_json(&self.context, "context")?,
            args_hash: self.args_hash,
            pending_branches: self.pending_branches.max(0) as u32,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error_message: self.error_message,
            retry_count: self.retry_count.max(0) as u32,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    step_id: String,
    workflow_id: String,
    step_name: String,
    step_order: i64,
    job_id: Option<i64>,
    queue_name: Option<String>,
    status: String,
    input_data: Option<String>,
    output_data: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            workflow_id: row.try_get("workflow_id")?,
            step_name: row.try_get("step_name")?,
            step_order: row.try_get("step_order")?,
            job_id: row.try_get("job_id")?,
            queue_name: row.try_get("queue_name")?,
            status: row.try_get("status")?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<WorkflowStep, RepositoryError> {
        Ok(WorkflowStep {
            step_id: parse_uuid(&self.step_id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            step_name: self.step_name,
            step_order: self.step_order.max(0) as u32,
            job_id: self.job_id,
            queue_name: self.queue_name,
            status: parse_status(&self.status, "step status")?,
            input_data: self
                .input_data
                .as_deref()
                .map(|s| parse_json(s, "step input"))
                .transpose()?,
            output_data: self
                .output_data
                .as_deref()
                .map(|s| parse_json(s, "step output"))
                .transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error_message: self.error_message,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn map_rows<T>(
    rows: &[sqlx::sqlite::SqliteRow],
    convert: impl Fn(&sqlx::sqlite::SqliteRow) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(convert).collect()
}

fn execution_from(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowExecution, RepositoryError> {
    ExecutionRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_execution()
}

fn step_from(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowStep, RepositoryError> {
    StepRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_step()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

/// Newest active execution for a dedup key, read through `pool`.
async fn active_id(
    pool: &SqlitePool,
    workflow_type: &str,
    org_id: Option<&str>,
    user_id: Option<&str>,
    args_hash: &str,
) -> Result<Option<Uuid>, RepositoryError> {
    let row = sqlx::query(
        r#"SELECT workflow_id FROM workflow_executions
           WHERE workflow_type = ?
             AND COALESCE(org_id, '') = ?
             AND COALESCE(user_id, '') = ?
             AND args_hash = ?
             AND status IN ('pending', 'running')
           ORDER BY created_at DESC
           LIMIT 1"#,
    )
    .bind(workflow_type)
    .bind(org_id.unwrap_or(""))
    .bind(user_id.unwrap_or(""))
    .bind(args_hash)
    .fetch_optional(pool)
    .await
    .map_err(|e| RepositoryError::Query(e.to_string()))?;

    match row {
        Some(row) => {
            let id: String = row
                .try_get("workflow_id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            Ok(Some(parse_uuid(&id)?))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn find_active(
        &self,
        workflow_type: &str,
        org_id: Option<&str>,
        user_id: Option<&str>,
        args_hash: &str,
    ) -> Result<Option<Uuid>, RepositoryError> {
        active_id(&self.pool.reader, workflow_type, org_id, user_id, args_hash).await
    }

    async fn insert_execution(&self, execution: &NewExecution) -> Result<InsertOutcome, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let context = to_json(&execution.context)?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_executions
               (workflow_id, workflow_type, org_id, user_id, status, current_step, context,
                args_hash, pending_branches, started_at, retry_count, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(execution.workflow_id.to_string())
        .bind(&execution.workflow_type)
        .bind(&execution.org_id)
        .bind(&execution.user_id)
        .bind(execution.status.as_str())
        .bind(&execution.current_step)
        .bind(&context)
        .bind(&execution.args_hash)
        .bind(i64::from(execution.pending_branches))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(InsertOutcome::Created(execution.workflow_id));
        }

        // Read back through the writer so the conflicting row is visible.
        let existing = active_id(
            &self.pool.writer,
            &execution.workflow_type,
            execution.org_id.as_deref(),
            execution.user_id.as_deref(),
            &execution.args_hash,
        )
        .await?;
        existing.map(InsertOutcome::Existing).ok_or_else(|| {
            RepositoryError::Conflict(format!(
                "workflow {} already exists",
                execution.workflow_id
            ))
        })
    }

    async fn get_execution(&self, workflow_id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE workflow_id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(execution_from).transpose()
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM workflow_executions WHERE 1 = 1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.workflow_type.is_some() {
            sql.push_str(" AND workflow_type = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, workflow_id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(workflow_type) = &filter.workflow_type {
            query = query.bind(workflow_type);
        }
        // SQLite treats a negative LIMIT as unbounded
        let limit = if filter.limit == 0 { -1 } else { i64::from(filter.limit) };

        let rows = query
            .bind(limit)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_rows(&rows, execution_from)
    }

    async fn record_step_success(
        &self,
        workflow_id: &Uuid,
        current_step: &str,
        output: &Map<String, Value>,
        successors: u32,
    ) -> Result<Option<AdvanceState>, RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let row = sqlx::query(
            "SELECT context, pending_branches FROM workflow_executions WHERE workflow_id = ? AND status = 'running'",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let context: String = row
            .try_get("context")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let pending: i64 = row
            .try_get("pending_branches")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut context = parse_json(&context, "context")?;
        merge_context(&mut context, output);
        let pending_branches = (pending.max(0) as u32 + successors).saturating_sub(1);

        sqlx::query(
            r#"UPDATE workflow_executions
               SET context = ?, current_step = ?, pending_branches = ?, updated_at = ?
               WHERE workflow_id = ? AND status = 'running'"#,
        )
        .bind(to_json(&context)?)
        .bind(current_step)
        .bind(i64::from(pending_branches))
        .bind(format_datetime(&Utc::now()))
        .bind(workflow_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(AdvanceState {
            context,
            pending_branches,
        }))
    }

    async fn transition_status(
        &self,
        workflow_id: &Uuid,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }

        let now = format_datetime(&Utc::now());
        let completed_at = to.is_terminal().then(|| now.clone());
        let sql = format!(
            r#"UPDATE workflow_executions
               SET status = ?,
                   completed_at = COALESCE(?, completed_at),
                   error_message = COALESCE(?, error_message),
                   updated_at = ?
               WHERE workflow_id = ? AND status IN ({})"#,
            placeholders(from.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(&completed_at)
            .bind(error)
            .bind(&now)
            .bind(workflow_id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return RepositoryError::Conflict(format!(
                        "another active workflow has the same start request as {workflow_id}"
                    ));
                }
                RepositoryError::Query(e.to_string())
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_for_restart(&self, workflow_id: &Uuid, from_step: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = 'pending',
                   completed_at = NULL,
                   error_message = NULL,
                   retry_count = retry_count + 1,
                   current_step = ?,
                   pending_branches = 1,
                   updated_at = ?
               WHERE workflow_id = ? AND status IN ('failed', 'cancelled')"#,
        )
        .bind(from_step)
        .bind(format_datetime(&Utc::now()))
        .bind(workflow_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return RepositoryError::Conflict(format!(
                    "another active workflow has the same start request as {workflow_id}"
                ));
            }
            RepositoryError::Query(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_active(&self, older_than: DateTime<Utc>) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_executions
               WHERE status IN ('pending', 'running') AND updated_at < ?
               ORDER BY updated_at ASC"#,
        )
        .bind(format_datetime(&older_than))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_rows(&rows, execution_from)
    }

    async fn upsert_step(&self, step: &WorkflowStep) -> Result<(), RepositoryError> {
        let input = step.input_data.as_ref().map(to_json).transpose()?;
        let output = step.output_data.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_steps
               (step_id, workflow_id, step_name, step_order, job_id, queue_name, status,
                input_data, output_data, started_at, completed_at, error_message,
                retry_count, max_retries, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, step_name) DO UPDATE SET
                 step_order = excluded.step_order,
                 job_id = excluded.job_id,
                 queue_name = excluded.queue_name,
                 status = excluded.status,
                 input_data = excluded.input_data,
                 output_data = excluded.output_data,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 error_message = excluded.error_message,
                 retry_count = excluded.retry_count,
                 max_retries = excluded.max_retries,
                 updated_at = excluded.updated_at"#,
        )
        .bind(step.step_id.to_string())
        .bind(step.workflow_id.to_string())
        .bind(&step.step_name)
        .bind(i64::from(step.step_order))
        .bind(step.job_id)
        .bind(&step.queue_name)
        .bind(step.status.as_str())
        .bind(&input)
        .bind(&output)
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(&step.error_message)
        .bind(i64::from(step.retry_count))
        .bind(i64::from(step.max_retries))
        .bind(format_datetime(&step.created_at))
        .bind(format_datetime(&step.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_step_status(
        &self,
        workflow_id: &Uuid,
        step_name: &str,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());
        let output = output.map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE workflow_steps
               SET status = ?,
                   output_data = COALESCE(?, output_data),
                   error_message = COALESCE(?, error_message),
                   completed_at = COALESCE(?, completed_at),
                   updated_at = ?
               WHERE workflow_id = ? AND step_name = ?"#,
        )
        .bind(status.as_str())
        .bind(&output)
        .bind(error)
        .bind(&completed_at)
        .bind(&now)
        .bind(workflow_id.to_string())
        .bind(step_name)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        Ok(())
    }

    async fn get_step(&self, workflow_id: &Uuid, step_name: &str) -> Result<Option<WorkflowStep>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE workflow_id = ? AND step_name = ?")
            .bind(workflow_id.to_string())
            .bind(step_name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(step_from).transpose()
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<WorkflowStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE workflow_id = ? ORDER BY step_order ASC, created_at ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_rows(&rows, step_from)
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
    use serde_json::json;

    fn new_execution(org_id: Option<&str>, args_hash: &str) -> NewExecution {
        NewExecution {
            workflow_id: Uuid::now_v7(),
            workflow_type: "user_signup".to_string(),
            org_id: org_id.map(str::to_string),
            user_id: None,
            status: WorkflowStatus::Running,
            current_step: Some("validate".to_string()),
            context: json!({"email": "ada@example.com"}),
            args_hash: args_hash.to_string(),
            pending_branches: 1,
        }
    }

    fn step_record(workflow_id: Uuid, name: &str, order: u32, status: StepStatus) -> WorkflowStep {
        let now = Utc::now();
        WorkflowStep {
            step_id: Uuid::now_v7(),
            workflow_id,
            step_name: name.to_string(),
            step_order: order,
            job_id: Some(1),
            queue_name: Some("default".to_string()),
            status,
            input_data: Some(json!({"step_name": name})),
            output_data: None,
            started_at: Some(now),
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        }
    }

    async fn repo_with_execution() -> (SqliteWorkflowRepository, Uuid) {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let id = repo
            .insert_execution(&new_execution(None, "h1"))
            .await
            .unwrap()
            .workflow_id();
        (repo, id)
    }

    #[tokio::test]
    async fn test_insert_and_get_execution() {
        let (repo, id) = repo_with_execution().await;

        let execution = repo.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.workflow_type, "user_signup");
        assert_eq!(execution.status, WorkflowStatus::Running);
        assert_eq!(execution.current_step.as_deref(), Some("validate"));
        assert_eq!(execution.context["email"], "ada@example.com");
        assert_eq!(execution.pending_branches, 1);
        assert!(execution.org_id.is_none());
        assert!(execution.completed_at.is_none());

        assert!(repo.get_execution(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_dedups_active_execution() {
        let (repo, id) = repo_with_execution().await;

        let second = repo.insert_execution(&new_execution(None, "h1")).await.unwrap();
        assert_eq!(second, InsertOutcome::Existing(id));

        // Different org or args is a different key
        let other_org = repo.insert_execution(&new_execution(Some("org_1"), "h1")).await.unwrap();
        assert!(matches!(other_org, InsertOutcome::Created(_)));
        let other_args = repo.insert_execution(&new_execution(None, "h2")).await.unwrap();
        assert!(matches!(other_args, InsertOutcome::Created(_)));

        assert_eq!(
            repo.find_active("user_signup", None, None, "h1").await.unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn test_terminal_execution_no_longer_dedups() {
        let (repo, id) = repo_with_execution().await;
        assert!(
            repo.transition_status(&id, &[WorkflowStatus::Running], WorkflowStatus::Completed, None)
                .await
                .unwrap()
        );

        assert!(repo.find_active("user_signup", None, None, "h1").await.unwrap().is_none());
        let again = repo.insert_execution(&new_execution(None, "h1")).await.unwrap();
        assert!(matches!(again, InsertOutcome::Created(new_id) if new_id != id));
    }

    #[tokio::test]
    async fn test_record_step_success_merges_and_counts_branches() {
        let (repo, id) = repo_with_execution().await;
        let output = json!({"user_id": "u1"});

        let state = repo
            .record_step_success(&id, "create_user", output.as_object().unwrap(), 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.pending_branches, 2);
        assert_eq!(state.context["user_id"], "u1");
        assert_eq!(state.context["email"], "ada@example.com");

        let leaf = repo
            .record_step_success(&id, "leaf", &Map::new(), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leaf.pending_branches, 1);

        let execution = repo.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.current_step.as_deref(), Some("leaf"));
        assert_eq!(execution.context["user_id"], "u1");
    }

    #[tokio::test]
    async fn test_record_step_success_ignores_inactive_workflow() {
        let (repo, id) = repo_with_execution().await;
        repo.transition_status(&id, &[WorkflowStatus::Running], WorkflowStatus::Cancelled, None)
            .await
            .unwrap();

        let output = json!({"late": true});
        let state = repo
            .record_step_success(&id, "create_user", output.as_object().unwrap(), 1)
            .await
            .unwrap();
        assert!(state.is_none());

        let execution = repo.get_execution(&id).await.unwrap().unwrap();
        assert!(execution.context.get("late").is_none());
    }

    #[tokio::test]
    async fn test_transition_status_guard_and_terminal_fields() {
        let (repo, id) = repo_with_execution().await;

        let moved = repo
            .transition_status(&id, &[WorkflowStatus::Pending], WorkflowStatus::Failed, Some("boom"))
            .await
            .unwrap();
        assert!(!moved, "guard should reject a running workflow");

        let moved = repo
            .transition_status(&id, &[WorkflowStatus::Pending, WorkflowStatus::Running], WorkflowStatus::Failed, Some("boom"))
            .await
            .unwrap();
        assert!(moved);

        let execution = repo.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert_eq!(execution.error_message.as_deref(), Some("boom"));
        assert!(execution.completed_at.is_some());

        assert!(!repo.transition_status(&id, &[], WorkflowStatus::Running, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_for_restart() {
        let (repo, id) = repo_with_execution().await;
        assert!(!repo.reset_for_restart(&id, "create_user").await.unwrap());

        repo.transition_status(&id, &[WorkflowStatus::Running], WorkflowStatus::Failed, Some("boom"))
            .await
            .unwrap();
        assert!(repo.reset_for_restart(&id, "create_user").await.unwrap());

        let execution = repo.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, WorkflowStatus::Pending);
        assert_eq!(execution.retry_count, 1);
        assert_eq!(execution.current_step.as_deref(), Some("create_user"));
        assert!(execution.error_message.is_none());
        assert!(execution.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_reset_conflicts_with_newer_active_duplicate() {
        let (repo, id) = repo_with_execution().await;
        repo.transition_status(&id, &[WorkflowStatus::Running], WorkflowStatus::Failed, None)
            .await
            .unwrap();
        repo.insert_execution(&new_execution(None, "h1")).await.unwrap();

        let err = repo.reset_for_restart(&id, "validate").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_executions_filters_and_orders() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let first = repo.insert_execution(&new_execution(None, "a")).await.unwrap().workflow_id();
        let second = repo.insert_execution(&new_execution(None, "b")).await.unwrap().workflow_id();
        repo.transition_status(&first, &[WorkflowStatus::Running], WorkflowStatus::Failed, None)
            .await
            .unwrap();

        let all = repo.list_executions(&ExecutionFilter::default()).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|e| e.workflow_id).collect();
        assert_eq!(ids, vec![second, first]);

        let failed = repo
            .list_executions(&ExecutionFilter {
                status: Some(WorkflowStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].workflow_id, first);

        let limited = repo
            .list_executions(&ExecutionFilter {
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let other_type = repo
            .list_executions(&ExecutionFilter {
                workflow_type: Some("other".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(other_type.is_empty());
    }

    #[tokio::test]
    async fn test_list_stale_active() {
        let (repo, id) = repo_with_execution().await;

        let none = repo.list_stale_active(Utc::now() - Duration::hours(1)).await.unwrap();
        assert!(none.is_empty());

        let stale = repo.list_stale_active(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].workflow_id, id);
    }

    #[tokio::test]
    async fn test_upsert_step_updates_in_place() {
        let (repo, id) = repo_with_execution().await;
        let first = step_record(id, "create_user", 1, StepStatus::Running);
        repo.upsert_step(&first).await.unwrap();

        let mut retry = step_record(id, "create_user", 1, StepStatus::Running);
        retry.retry_count = 1;
        retry.job_id = Some(2);
        repo.upsert_step(&retry).await.unwrap();
        repo.upsert_step(&step_record(id, "validate", 0, StepStatus::Completed)).await.unwrap();

        let steps = repo.list_steps(&id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_name, "validate");
        assert_eq!(steps[1].step_id, first.step_id, "record keeps its original id");
        assert_eq!(steps[1].retry_count, 1);
        assert_eq!(steps[1].job_id, Some(2));
        assert_eq!(steps[1].input_data, Some(json!({"step_name": "create_user"})));
    }

    #[tokio::test]
    async fn test_update_step_status() {
        let (repo, id) = repo_with_execution().await;
        repo.upsert_step(&step_record(id, "create_user", 1, StepStatus::Running)).await.unwrap();

        repo.update_step_status(&id, "create_user", StepStatus::Completed, Some(&json!({"user_id": "u1"})), None)
            .await
            .unwrap();

        let step = &repo.list_steps(&id).await.unwrap()[0];
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.output_data, Some(json!({"user_id": "u1"})));
        assert!(step.completed_at.is_some());

        let err = repo
            .update_step_status(&id, "missing", StepStatus::Failed, None, Some("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_get_step() {
        let (repo, id) = repo_with_execution().await;
        assert!(repo.get_step(&id, "create_user").await.unwrap().is_none());

        let mut record = step_record(id, "create_user", 1, StepStatus::Running);
        record.job_id = Some(7);
        repo.upsert_step(&record).await.unwrap();
        repo.update_step_status(&id, "create_user", StepStatus::Skipped, None, None)
            .await
            .unwrap();

        let step = repo.get_step(&id, "create_user").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
        assert_eq!(step.job_id, Some(7));
        assert!(repo.get_step(&Uuid::now_v7(), "create_user").await.unwrap().is_none());
    }
}
