//! Orchestrator: starts workflows, advances them as steps finish, and owns
//! every status transition of an execution.
//!
//! State machine:
//! ```text
//! pending -> running -> { completed, failed, cancelled }
//! failed | cancelled -> pending   (restart)
//! ```

use std::sync::Arc;

use sagaflow_types::config::EngineConfig;
use sagaflow_types::definition::QUEUE_DEFAULT;
use sagaflow_types::workflow::{
    ExecutionFilter, InsertOutcome, NewExecution, StepStatus, WorkflowExecution, WorkflowProgress,
    WorkflowStatus, WorkflowStep, WorkflowSummary,
};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::{ContentHasher, args_hash, normalize_id};
use crate::queue::JobQueue;
use crate::repository::workflow::WorkflowRepository;

use super::compensation::{CompensationReport, run_compensation};
use super::definition::WorkflowError;
use super::dispatcher::{DispatchRequest, StepDispatcher};
use super::registry::Registry;

// ---------------------------------------------------------------------------
// Settings & outcomes
// ---------------------------------------------------------------------------

/// Orchestrator behavior knobs, usually taken from `EngineConfig`.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Lane for steps whose definition names none.
    pub default_queue: String,
    /// Compensate completed steps as soon as a workflow fails.
    pub auto_compensate: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_queue: config.default_queue.clone(),
            auto_compensate: config.auto_compensate,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_queue: QUEUE_DEFAULT.to_string(),
            auto_compensate: true,
        }
    }
}

/// What `advance` did with a finished step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The workflow was no longer running; nothing was written.
    Ignored,
    /// Successor steps were dispatched.
    Advanced { dispatched: Vec<String> },
    /// A leaf finished while other branches are still pending.
    BranchFinished { remaining: u32 },
    /// The last pending branch finished; the workflow is completed.
    Completed,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Coordinates workflow executions over a repository and a job queue.
pub struct Orchestrator<R, Q, H>
where
    R: WorkflowRepository,
    Q: JobQueue,
    H: ContentHasher,
{
    repo: Arc<R>,
    registry: Arc<Registry>,
    dispatcher: StepDispatcher<Q>,
    hasher: Arc<H>,
    settings: OrchestratorSettings,
}

impl<R, Q, H> Orchestrator<R, Q, H>
where
    R: WorkflowRepository,
    Q: JobQueue,
    H: ContentHasher,
{
    pub fn new(
        repo: Arc<R>,
        queue: Arc<Q>,
        registry: Arc<Registry>,
        hasher: Arc<H>,
        settings: OrchestratorSettings,
    ) -> Self {
        let dispatcher = StepDispatcher::new(
            Arc::clone(&registry),
            queue,
            settings.default_queue.clone(),
        );
        Self {
            repo,
            registry,
            dispatcher,
            hasher,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Start a workflow, or return the ID of an identical one still active.
    ///
    /// The execution row is written as `running` before the first step is
    /// dispatched. If that dispatch fails the error is returned and the row
    /// stays `running` with no job, for the stuck-workflow monitor to report.
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        org_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Uuid, WorkflowError> {
        let definition = self.registry.require_definition(workflow_type)?;
        let first = definition
            .first_step()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_type.to_string()))?;

        let context = match input {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(WorkflowError::InvalidInput(format!(
                    "workflow input must be a JSON object, got {}",
                    json_kind(&other)
                )));
            }
        };

        let org_id = normalize_id(org_id);
        let user_id = normalize_id(user_id);
        let hash = args_hash(self.hasher.as_ref(), &context)?;

        if let Some(existing) = self
            .repo
            .find_active(workflow_type, org_id, user_id, &hash)
            .await?
        {
            info!(workflow_id = %existing, workflow_type, "duplicate start request, returning active workflow");
            return Ok(existing);
        }

        let new = NewExecution {
            workflow_id: Uuid::now_v7(),
            workflow_type: workflow_type.to_string(),
            org_id: org_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
            status: WorkflowStatus::Running,
            current_step: Some(first.name.clone()),
            context,
            args_hash: hash,
            pending_branches: 1,
        };

        let workflow_id = match self.repo.insert_execution(&new).await? {
            InsertOutcome::Created(id) => id,
            InsertOutcome::Existing(id) => {
                info!(workflow_id = %id, workflow_type, "concurrent duplicate start, returning active workflow");
                return Ok(id);
            }
        };

        let dispatched = self
            .dispatcher
            .enqueue(DispatchRequest {
                workflow_id,
                workflow_type,
                step_name: &first.name,
                workflow_context: new.context.as_object().cloned().unwrap_or_default(),
                step_context: Value::Null,
                org_id,
                user_id,
            })
            .await;
        if let Err(e) = dispatched {
            error!(
                workflow_id = %workflow_id,
                step = %first.name,
                error = %e,
                "failed to dispatch first step; workflow left running without a job"
            );
            return Err(e);
        }

        info!(workflow_id = %workflow_id, workflow_type, first_step = %first.name, "workflow started");
        Ok(workflow_id)
    }

    // -----------------------------------------------------------------------
    // Advance / fail
    // -----------------------------------------------------------------------

    /// Record a finished step and move the workflow forward.
    ///
    /// Merges `output` into the context, then dispatches every successor with
    /// the merged context. A leaf step completes the workflow once no other
    /// branch is pending. Does nothing when the workflow is not `running`.
    pub async fn advance(
        &self,
        workflow_id: &Uuid,
        step_name: &str,
        output: &Map<String, Value>,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let execution = self.load(workflow_id).await?;
        let definition = self
            .registry
            .definition(&execution.workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(execution.workflow_type.clone()))?;
        let step = definition
            .step(step_name)
            .ok_or_else(|| WorkflowError::StepNotFound {
                workflow_type: execution.workflow_type.clone(),
                step: step_name.to_string(),
            })?;

        let current = step.next_steps.first().map_or(step_name, String::as_str);
        let Some(state) = self
            .repo
            .record_step_success(workflow_id, current, output, step.next_steps.len() as u32)
            .await?
        else {
            debug!(workflow_id = %workflow_id, step = step_name, "workflow not running, advance ignored");
            return Ok(AdvanceOutcome::Ignored);
        };

        if step.is_leaf() {
            if state.pending_branches > 0 {
                debug!(
                    workflow_id = %workflow_id,
                    step = step_name,
                    remaining = state.pending_branches,
                    "branch finished"
                );
                return Ok(AdvanceOutcome::BranchFinished {
                    remaining: state.pending_branches,
                });
            }
            let completed = self
                .repo
                .transition_status(workflow_id, &[WorkflowStatus::Running], WorkflowStatus::Completed, None)
                .await?;
            if !completed {
                debug!(workflow_id = %workflow_id, "workflow left running state before completion");
                return Ok(AdvanceOutcome::Ignored);
            }
            info!(workflow_id = %workflow_id, workflow_type = %execution.workflow_type, "workflow completed");
            return Ok(AdvanceOutcome::Completed);
        }

        let context = state.context.as_object().cloned().unwrap_or_default();
        let mut dispatched = Vec::with_capacity(step.next_steps.len());
        for next in &step.next_steps {
            self.dispatcher
                .enqueue(DispatchRequest {
                    workflow_id: *workflow_id,
                    workflow_type: &execution.workflow_type,
                    step_name: next,
                    workflow_context: context.clone(),
                    step_context: Value::Null,
                    org_id: execution.org_id.as_deref(),
                    user_id: execution.user_id.as_deref(),
                })
                .await?;
            dispatched.push(next.clone());
        }
        debug!(workflow_id = %workflow_id, step = step_name, next = ?dispatched, "workflow advanced");
        Ok(AdvanceOutcome::Advanced { dispatched })
    }

    /// Mark a workflow failed with `error` recorded verbatim.
    ///
    /// Returns `false` when the workflow was already terminal. With
    /// `auto_compensate` on, completed steps are compensated afterwards;
    /// compensation problems are logged, never returned.
    pub async fn fail_workflow(
        &self,
        workflow_id: &Uuid,
        step_name: Option<&str>,
        error: &str,
    ) -> Result<bool, WorkflowError> {
        let failed = self
            .repo
            .transition_status(
                workflow_id,
                &[WorkflowStatus::Pending, WorkflowStatus::Running],
                WorkflowStatus::Failed,
                Some(error),
            )
            .await?;
        if !failed {
            debug!(workflow_id = %workflow_id, "workflow already terminal, failure not recorded");
            return Ok(false);
        }
        warn!(workflow_id = %workflow_id, step = ?step_name, error, "workflow failed");

        if self.settings.auto_compensate {
            match self.compensate(workflow_id).await {
                Ok(report) if !report.is_clean() => {
                    warn!(
                        workflow_id = %workflow_id,
                        failed = report.failed.len(),
                        "compensation finished with errors"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(workflow_id = %workflow_id, error = %e, "compensation could not run");
                }
            }
        }
        Ok(true)
    }

    /// Compensate a failed or cancelled workflow's completed steps in reverse
    /// step order.
    ///
    /// Each undone step is marked `skipped`, so a later call only walks steps
    /// whose compensation failed or never ran.
    pub async fn compensate(&self, workflow_id: &Uuid) -> Result<CompensationReport, WorkflowError> {
        let execution = self.load(workflow_id).await?;
        if !matches!(
            execution.status,
            WorkflowStatus::Failed | WorkflowStatus::Cancelled
        ) {
            return Err(WorkflowError::ValidationError(format!(
                "workflow {workflow_id} is {}; only failed or cancelled workflows can be compensated",
                execution.status
            )));
        }
        let steps = self.repo.list_steps(workflow_id).await?;
        let report = run_compensation(&self.registry, &execution, &steps).await;
        for step in &report.compensated {
            self.repo
                .update_step_status(workflow_id, step, StepStatus::Skipped, None, None)
                .await?;
        }
        info!(
            workflow_id = %workflow_id,
            compensated = report.compensated.len(),
            failed = report.failed.len(),
            "compensation run"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Cancel a pending or running workflow.
    ///
    /// In-flight step jobs are not interrupted; their results are ignored.
    pub async fn cancel_workflow(&self, workflow_id: &Uuid) -> Result<(), WorkflowError> {
        let execution = self.load(workflow_id).await?;
        let cancelled = self
            .repo
            .transition_status(
                workflow_id,
                &[WorkflowStatus::Pending, WorkflowStatus::Running],
                WorkflowStatus::Cancelled,
                None,
            )
            .await?;
        if !cancelled {
            let from = self
                .repo
                .get_execution(workflow_id)
                .await?
                .map_or(execution.status, |e| e.status);
            return Err(WorkflowError::InvalidTransition {
                workflow_id: *workflow_id,
                from,
                to: WorkflowStatus::Cancelled,
            });
        }
        info!(workflow_id = %workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Restart a failed or cancelled workflow from `from_step` (default: the
    /// first step), keeping its accumulated context.
    pub async fn restart_workflow(
        &self,
        workflow_id: &Uuid,
        from_step: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let execution = self.load(workflow_id).await?;
        let definition = self.registry.require_definition(&execution.workflow_type)?;
        let step_name = match from_step {
            Some(name) => definition
                .step(name)
                .map(|s| s.name.clone())
                .ok_or_else(|| WorkflowError::StepNotFound {
                    workflow_type: execution.workflow_type.clone(),
                    step: name.to_string(),
                })?,
            None => definition
                .first_step()
                .map(|s| s.name.clone())
                .ok_or_else(|| WorkflowError::UnknownWorkflow(execution.workflow_type.clone()))?,
        };

        let invalid = |from| WorkflowError::InvalidTransition {
            workflow_id: *workflow_id,
            from,
            to: WorkflowStatus::Pending,
        };
        if !matches!(
            execution.status,
            WorkflowStatus::Failed | WorkflowStatus::Cancelled
        ) {
            return Err(invalid(execution.status));
        }
        if !self.repo.reset_for_restart(workflow_id, &step_name).await? {
            let current = self.load(workflow_id).await?;
            return Err(invalid(current.status));
        }
        self.repo
            .transition_status(workflow_id, &[WorkflowStatus::Pending], WorkflowStatus::Running, None)
            .await?;

        let execution = self.load(workflow_id).await?;
        self.dispatcher
            .enqueue(DispatchRequest {
                workflow_id: *workflow_id,
                workflow_type: &execution.workflow_type,
                step_name: &step_name,
                workflow_context: execution.context_map(),
                step_context: Value::Null,
                org_id: execution.org_id.as_deref(),
                user_id: execution.user_id.as_deref(),
            })
            .await?;

        info!(
            workflow_id = %workflow_id,
            from_step = %step_name,
            restarts = execution.retry_count,
            "workflow restarted"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_workflow_status(&self, workflow_id: &Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.load(workflow_id).await
    }

    pub async fn get_workflow_steps(&self, workflow_id: &Uuid) -> Result<Vec<WorkflowStep>, WorkflowError> {
        self.load(workflow_id).await?;
        Ok(self.repo.list_steps(workflow_id).await?)
    }

    pub async fn get_workflow_progress(&self, workflow_id: &Uuid) -> Result<WorkflowProgress, WorkflowError> {
        let execution = self.load(workflow_id).await?;
        let steps = self.repo.list_steps(workflow_id).await?;
        Ok(self.progress_of(&execution, &steps))
    }

    pub async fn get_workflow_summary(&self, workflow_id: &Uuid) -> Result<WorkflowSummary, WorkflowError> {
        let execution = self.load(workflow_id).await?;
        let steps = self.repo.list_steps(workflow_id).await?;
        let progress = self.progress_of(&execution, &steps);
        Ok(WorkflowSummary {
            execution,
            steps,
            progress,
        })
    }

    pub async fn list_workflows(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self.repo.list_executions(filter).await?)
    }

    fn progress_of(&self, execution: &WorkflowExecution, steps: &[WorkflowStep]) -> WorkflowProgress {
        let completed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count() as u32;
        let total = self
            .registry
            .definition(&execution.workflow_type)
            .map_or(steps.len(), |def| def.steps.len()) as u32;
        WorkflowProgress::new(completed, total)
    }

    async fn load(&self, workflow_id: &Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.repo
            .get_execution(workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound(*workflow_id))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
