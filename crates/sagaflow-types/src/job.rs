//! Queue job types.
//!
//! Every step dispatch is one `StepJob` envelope inserted into the durable job
//! queue. The step name inside the envelope, not a per-step payload type,
//! selects the handler that runs it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::step::StepInput;

/// Queue-assigned job identifier.
pub type JobId = i64;

// ---------------------------------------------------------------------------
// StepJob envelope
// ---------------------------------------------------------------------------

/// Payload of every workflow step job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJob {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Workflow context snapshot at dispatch time.
    #[serde(default)]
    pub workflow_input: Map<String, Value>,
    #[serde(default)]
    pub step_input: Value,
}

impl StepJob {
    /// Routing kind shared by all step jobs.
    pub const KIND: &'static str = "workflow_step";
}

impl From<StepJob> for StepInput {
    fn from(job: StepJob) -> Self {
        StepInput {
            workflow_id: job.workflow_id,
            workflow_type: job.workflow_type,
            step_name: job.step_name,
            org_id: job.org_id,
            user_id: job.user_id,
            workflow_input: job.workflow_input,
            step_input: job.step_input,
        }
    }
}

// ---------------------------------------------------------------------------
// Insert options
// ---------------------------------------------------------------------------

/// Per-insert routing and retry options.
#[derive(Debug, Clone)]
pub struct InsertOpts {
    pub queue: String,
    /// 1 is the highest priority.
    pub priority: i16,
    /// First run plus retries.
    pub max_attempts: u32,
    /// Run no earlier than this (immediately when `None`).
    pub scheduled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Job records
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Retryable,
    Completed,
    Discarded,
}

impl JobState {
    pub fn is_finalized(self) -> bool {
        matches!(self, JobState::Completed | JobState::Discarded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub queue: String,
    pub priority: i16,
    pub payload: Value,
    pub state: JobState,
    /// 1-based number of the current (or last) attempt; 0 before the first fetch.
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether the queue may run this job again after the current attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Decode a step job payload.
    pub fn step_job(&self) -> Result<StepJob, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub state: Option<JobState>,
    pub limit: u32,
}
