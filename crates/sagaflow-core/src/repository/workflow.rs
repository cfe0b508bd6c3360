//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow executions and their step
//! records. The infrastructure layer (sagaflow-infra) implements this trait
//! with SQLite persistence.

use chrono::{DateTime, Utc};
use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::{
    AdvanceState, ExecutionFilter, InsertOutcome, NewExecution, StepStatus, WorkflowExecution,
    WorkflowStatus, WorkflowStep,
};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers two entity families:
/// - **Executions:** dedup-aware insert, guarded status transitions, context
///   merges, and queries.
/// - **Steps:** one record per (workflow, step), upserted when a worker begins
///   and updated in place as the step finishes or retries.
///
/// Every mutation of an execution row is a single guarded write so concurrent
/// step runners for the same workflow serialize on the row.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Most recent `pending`/`running` execution matching the dedup key.
    ///
    /// Empty `org_id`/`user_id` match rows where the column is NULL.
    fn find_active(
        &self,
        workflow_type: &str,
        org_id: Option<&str>,
        user_id: Option<&str>,
        args_hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<Uuid>, RepositoryError>> + Send;

    /// Insert a new execution unless an active one with the same dedup key
    /// exists, in which case the existing ID is returned.
    fn insert_execution(
        &self,
        execution: &NewExecution,
    ) -> impl std::future::Future<Output = Result<InsertOutcome, RepositoryError>> + Send;

    /// Get an execution by ID.
    fn get_execution(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions, newest first.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Merge a finished step's output into a `running` execution.
    ///
    /// Sets `current_step`, and adjusts the join counter by
    /// `successors - 1`. Returns `None` without writing when the execution
    /// is not `running`.
    fn record_step_success(
        &self,
        workflow_id: &Uuid,
        current_step: &str,
        output: &Map<String, Value>,
        successors: u32,
    ) -> impl std::future::Future<Output = Result<Option<AdvanceState>, RepositoryError>> + Send;

    /// Move an execution to `to` if its status is one of `from`.
    ///
    /// Terminal targets stamp `completed_at`; `error` is recorded verbatim
    /// when given. Returns `false` when the guard did not match.
    fn transition_status(
        &self,
        workflow_id: &Uuid,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Reset a `failed`/`cancelled` execution to `pending` for a restart.
    ///
    /// Clears `completed_at` and `error_message`, increments `retry_count`,
    /// points `current_step` at `from_step`, and sets one pending branch.
    /// Returns `false` when the execution was not in a restartable status.
    fn reset_for_restart(
        &self,
        workflow_id: &Uuid,
        from_step: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Active executions whose row has not changed since `older_than`.
    fn list_stale_active(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert a step record, or overwrite the attempt fields of the existing
    /// record for the same (workflow, step name).
    fn upsert_step(
        &self,
        step: &WorkflowStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a step's status and optionally its output/error.
    fn update_step_status(
        &self,
        workflow_id: &Uuid,
        step_name: &str,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The step record for (workflow, step name), if one was written.
    fn get_step(
        &self,
        workflow_id: &Uuid,
        step_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowStep>, RepositoryError>> + Send;

    /// All step records for a workflow, ordered by step order.
    fn list_steps(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowStep>, RepositoryError>> + Send;
}
