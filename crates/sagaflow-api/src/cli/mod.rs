//! CLI command definitions for the `sagaflow` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow commands take the
//! workflow UUID as their positional argument.

pub mod housekeeping;
pub mod jobs;
pub mod worker;
pub mod workflow;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use sagaflow_core::signup::WORKFLOW_TYPE;
use sagaflow_types::job::JobState;
use sagaflow_types::workflow::WorkflowStatus;

/// Run and inspect saga workflows.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write log lines to stderr as JSON.
    #[arg(long, global = true, env = "SAGAFLOW_LOG_JSON")]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "SAGAFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow (or return the matching active one).
    Start {
        /// Registered workflow type.
        #[arg(long = "type", default_value = WORKFLOW_TYPE)]
        workflow_type: String,

        /// Workflow input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Organization the workflow belongs to.
        #[arg(long)]
        org_id: Option<String>,

        /// User the workflow belongs to.
        #[arg(long)]
        user_id: Option<String>,

        /// Process queued jobs in this process until nothing is due.
        #[arg(long)]
        run: bool,
    },

    /// Show a workflow's execution record.
    Status {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// Show the step records of a workflow.
    Steps {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// Show how many steps of a workflow have completed.
    Progress {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// List workflows, newest first.
    #[command(alias = "ls")]
    List {
        /// Only workflows in this status.
        #[arg(long)]
        status: Option<StatusArg>,

        /// Only workflows of this type.
        #[arg(long = "type")]
        workflow_type: Option<String>,

        /// Maximum number of workflows to display (0 for all).
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a pending or running workflow.
    Cancel {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// Restart a failed or cancelled workflow.
    Restart {
        /// Workflow UUID.
        workflow_id: String,

        /// Step to resume from (defaults to the first step).
        #[arg(long)]
        from_step: Option<String>,
    },

    /// Undo the completed steps of a failed or cancelled workflow.
    Compensate {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// List active workflows that have not progressed recently.
    Stuck,

    /// List queued jobs, newest first.
    Jobs {
        /// Only jobs in this queue lane.
        #[arg(long)]
        queue: Option<String>,

        /// Only jobs in this state.
        #[arg(long)]
        state: Option<JobStateArg>,

        /// Maximum number of jobs to display (0 for all).
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Delete finished workflows and jobs past the retention window.
    Cleanup,

    /// Run queue workers until interrupted.
    Worker {
        /// Process every due job once, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusArg> for WorkflowStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => WorkflowStatus::Pending,
            StatusArg::Running => WorkflowStatus::Running,
            StatusArg::Completed => WorkflowStatus::Completed,
            StatusArg::Failed => WorkflowStatus::Failed,
            StatusArg::Cancelled => WorkflowStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JobStateArg {
    Available,
    Running,
    Retryable,
    Completed,
    Discarded,
}

impl From<JobStateArg> for JobState {
    fn from(arg: JobStateArg) -> Self {
        match arg {
            JobStateArg::Available => JobState::Available,
            JobStateArg::Running => JobState::Running,
            JobStateArg::Retryable => JobState::Retryable,
            JobStateArg::Completed => JobState::Completed,
            JobStateArg::Discarded => JobState::Discarded,
        }
    }
}

/// Parse a workflow UUID from the command line.
pub fn parse_workflow_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("Invalid workflow ID: '{raw}'"))
}

/// First eight characters of an ID, for table cells.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
