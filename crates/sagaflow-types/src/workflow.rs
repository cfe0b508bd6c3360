//! Workflow execution records.
//!
//! `WorkflowExecution` is the durable record of one workflow instance and
//! `WorkflowStep` is the durable record of one logical step within it (a single
//! row per step, updated in place across retries). Both are persisted by the
//! infrastructure layer and returned by the orchestrator's query API.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow execution.
///
/// `pending -> running -> {completed, failed, cancelled}`; `failed` and
/// `cancelled` may be moved back to `pending` by a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses carry a `completed_at` timestamp.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Statuses that participate in start-request deduplication.
    pub fn is_active(self) -> bool {
        matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workflow Execution
// ---------------------------------------------------------------------------

/// One workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 workflow ID.
    pub workflow_id: Uuid,
    /// Registered workflow type name.
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: WorkflowStatus,
    /// Step most recently dispatched (or finished, once the workflow is terminal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Accumulated JSON context: the start input plus every step's output.
    pub context: Value,
    /// Content digest of the start input.
    pub args_hash: String,
    /// Dispatched branches that have not yet finished (join counter).
    pub pending_branches: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of times the workflow has been restarted.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// The context as a JSON object (empty when the stored context is not an object).
    pub fn context_map(&self) -> Map<String, Value> {
        self.context.as_object().cloned().unwrap_or_default()
    }
}

/// Values required to insert a new execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    pub context: Value,
    pub args_hash: String,
    pub pending_branches: u32,
}

/// Result of a dedup-aware insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new execution row was written.
    Created(Uuid),
    /// An active execution with the same dedup key already existed.
    Existing(Uuid),
}

impl InsertOutcome {
    pub fn workflow_id(self) -> Uuid {
        match self {
            InsertOutcome::Created(id) | InsertOutcome::Existing(id) => id,
        }
    }
}

/// Execution state after a step's output has been merged.
#[derive(Debug, Clone)]
pub struct AdvanceState {
    /// Context after the merge.
    pub context: Value,
    /// Join counter after this step finished and its successors were counted.
    pub pending_branches: u32,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<String>,
    pub limit: u32,
}

// ---------------------------------------------------------------------------
// Workflow Step
// ---------------------------------------------------------------------------

/// The durable record of one logical step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// UUIDv7 step record ID.
    pub step_id: Uuid,
    pub workflow_id: Uuid,
    pub step_name: String,
    /// Zero-based position of the step in its workflow definition.
    pub step_order: u32,
    /// Queue job that last ran this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    pub status: StepStatus,
    /// Snapshot of the `StepInput` the step ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,
    /// Output map produced by the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Attempts beyond the first (attempt 3 => retry_count 2).
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// Completion progress of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub completed_steps: u32,
    pub total_steps: u32,
    /// `completed_steps / total_steps`, or 0 when the workflow has no steps.
    pub ratio: f64,
}

impl WorkflowProgress {
    pub fn new(completed_steps: u32, total_steps: u32) -> Self {
        let ratio = if total_steps == 0 {
            0.0
        } else {
            f64::from(completed_steps) / f64::from(total_steps)
        };
        Self {
            completed_steps,
            total_steps,
            ratio,
        }
    }
}

/// A complete view of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowStep>,
    pub progress: WorkflowProgress,
}

// ---------------------------------------------------------------------------
// Context merge
// ---------------------------------------------------------------------------

/// Merge a step's output map into a workflow context.
///
/// Additive and last-write-wins per key. A non-object context is replaced by
/// an object holding only the output.
pub fn merge_context(context: &mut Value, output: &Map<String, Value>) {
    if !context.is_object() {
        *context = Value::Object(Map::new());
    }
    if let Some(target) = context.as_object_mut() {
        for (key, value) in output {
            target.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
