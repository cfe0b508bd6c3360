//! Step runner: the job worker for `StepJob`s.
//!
//! One `work` call is one attempt of one step. The runner keeps the step
//! record in sync with the attempt, executes the handler under the step's
//! timeout, and then either advances the workflow, hands the job back to the
//! queue for another attempt, or fails the workflow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_types::definition::{DEFAULT_STEP_TIMEOUT_SECS, StepDefinition, WorkflowDefinition};
use sagaflow_types::job::{JobRecord, StepJob};
use sagaflow_types::retry::RetryPolicy;
use sagaflow_types::step::{StepError, StepInput, StepResult};
use sagaflow_types::workflow::{StepStatus, WorkflowStatus, WorkflowStep};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::ContentHasher;
use crate::queue::{JobError, JobQueue, JobWorker};
use crate::repository::workflow::WorkflowRepository;

use super::context::{check_context_size, check_output_size};
use super::definition::WorkflowError;
use super::handler::BoxStepHandler;
use super::orchestrator::Orchestrator;
use super::retry::RetryHandler;

/// Extra time the queue allows beyond a step's own timeout, so the runner's
/// timeout fires first and the failure is recorded on the step.
pub const QUEUE_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Executes step jobs on behalf of the queue.
pub struct StepRunner<R, Q, H>
where
    R: WorkflowRepository,
    Q: JobQueue,
    H: ContentHasher,
{
    orchestrator: Arc<Orchestrator<R, Q, H>>,
}

/// Resolved pieces of a step needed to run one attempt.
struct ResolvedStep<'a> {
    definition: &'a WorkflowDefinition,
    step: &'a StepDefinition,
    handler: &'a BoxStepHandler,
}

impl<R, Q, H> StepRunner<R, Q, H>
where
    R: WorkflowRepository,
    Q: JobQueue,
    H: ContentHasher,
{
    pub fn new(orchestrator: Arc<Orchestrator<R, Q, H>>) -> Self {
        Self { orchestrator }
    }

    async fn run(&self, job: &JobRecord, step_job: StepJob) -> Result<(), JobError> {
        let repo = self.orchestrator.repository();
        let workflow_id = step_job.workflow_id;
        let step_name = step_job.step_name.clone();

        let execution = repo
            .get_execution(&workflow_id)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?
            .ok_or_else(|| JobError::Discard(format!("workflow {workflow_id} not found")))?;
        if execution.status != WorkflowStatus::Running {
            debug!(
                workflow_id = %workflow_id,
                step = %step_name,
                status = %execution.status,
                "workflow not running, skipping step"
            );
            return Ok(());
        }

        // A redelivered job whose attempt already finished must not run the
        // handler or advance the workflow a second time. Restarts dispatch
        // fresh jobs, so they are not caught here.
        let existing = repo
            .get_step(&workflow_id, &step_name)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;
        if existing.is_some_and(|s| s.status == StepStatus::Completed && s.job_id == Some(job.id)) {
            debug!(
                workflow_id = %workflow_id,
                step = %step_name,
                job_id = job.id,
                "step already completed by this job, skipping"
            );
            return Ok(());
        }

        let resolved = self.resolve(&step_job.workflow_type, &step_name);
        let step_order = resolved
            .as_ref()
            .ok()
            .and_then(|r| r.definition.step_order(&step_name))
            .unwrap_or(0);
        let input = StepInput::from(step_job);

        let now = Utc::now();
        let record = WorkflowStep {
            step_id: Uuid::now_v7(),
            workflow_id,
            step_name: step_name.clone(),
            step_order,
            job_id: Some(job.id),
            queue_name: Some(job.queue.clone()),
            status: StepStatus::Running,
            input_data: serde_json::to_value(&input).ok(),
            output_data: None,
            started_at: Some(now),
            completed_at: None,
            error_message: None,
            retry_count: job.attempt.saturating_sub(1),
            max_retries: job.max_attempts.saturating_sub(1),
            created_at: now,
            updated_at: now,
        };
        repo.upsert_step(&record)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(err) => return self.terminal_failure(&input, true, err).await,
        };

        debug!(
            workflow_id = %workflow_id,
            step = %step_name,
            attempt = job.attempt,
            "executing step"
        );
        let limit = Duration::from_secs(resolved.definition.timeout_secs_for(resolved.step));
        let outcome = match tokio::time::timeout(limit, resolved.handler.execute(&input)).await {
            Ok(Ok(result)) => into_output(result),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(StepError::timeout(format!(
                "step '{step_name}' exceeded its {}s timeout",
                limit.as_secs()
            ))),
        }
        .and_then(|output| {
            check_output_size(&step_name, &output)?;
            check_context_size(&execution.context, &output)?;
            Ok(output)
        });

        match outcome {
            Ok(output) => self.succeed(&input, output).await,
            Err(err) => {
                let retryable = resolved.handler.is_retryable(&err);
                if retryable && job.has_attempts_left() {
                    let message = err.to_string();
                    repo.update_step_status(&workflow_id, &step_name, StepStatus::Pending, None, Some(&message))
                        .await
                        .map_err(|e| JobError::Retry(e.to_string()))?;
                    warn!(
                        workflow_id = %workflow_id,
                        step = %step_name,
                        attempt = job.attempt,
                        max_attempts = job.max_attempts,
                        error = %message,
                        "step failed, will retry"
                    );
                    return Err(JobError::Retry(message));
                }
                self.terminal_failure(&input, resolved.step.required, err).await
            }
        }
    }

    async fn succeed(&self, input: &StepInput, output: Map<String, Value>) -> Result<(), JobError> {
        let repo = self.orchestrator.repository();
        let output_value = Value::Object(output.clone());
        repo.update_step_status(
            &input.workflow_id,
            &input.step_name,
            StepStatus::Completed,
            Some(&output_value),
            None,
        )
        .await
        .map_err(|e| JobError::Retry(e.to_string()))?;
        info!(workflow_id = %input.workflow_id, step = %input.step_name, "step completed");

        if let Err(e) = self
            .orchestrator
            .advance(&input.workflow_id, &input.step_name, &output)
            .await
        {
            // The retry has to execute the step again, so the row must not
            // read as completed by this job.
            if let Err(reset) = repo
                .update_step_status(
                    &input.workflow_id,
                    &input.step_name,
                    StepStatus::Pending,
                    None,
                    Some(&e.to_string()),
                )
                .await
            {
                warn!(
                    workflow_id = %input.workflow_id,
                    step = %input.step_name,
                    error = %reset,
                    "could not reset step after failed advance"
                );
            }
            return Err(JobError::Retry(e.to_string()));
        }
        Ok(())
    }

    /// Record a failure that will not be retried.
    ///
    /// An optional step lets the workflow continue with no output; a required
    /// one fails the workflow and discards the job.
    async fn terminal_failure(&self, input: &StepInput, required: bool, err: StepError) -> Result<(), JobError> {
        let repo = self.orchestrator.repository();
        let message = err.to_string();
        repo.update_step_status(&input.workflow_id, &input.step_name, StepStatus::Failed, None, Some(&message))
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        if !required {
            warn!(
                workflow_id = %input.workflow_id,
                step = %input.step_name,
                error = %message,
                "optional step failed, continuing"
            );
            self.orchestrator
                .advance(&input.workflow_id, &input.step_name, &Map::new())
                .await
                .map_err(|e| JobError::Retry(e.to_string()))?;
            return Ok(());
        }

        self.orchestrator
            .fail_workflow(&input.workflow_id, Some(&input.step_name), &message)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;
        Err(JobError::Discard(message))
    }

    /// Fail the step behind a job the queue has given up on.
    ///
    /// Does nothing once the workflow has left `running` or the step row is
    /// already terminal, so discards the runner asked for itself are not
    /// recorded twice.
    async fn abandon(&self, step_job: &StepJob, reason: &str) -> Result<(), WorkflowError> {
        let repo = self.orchestrator.repository();
        let workflow_id = step_job.workflow_id;
        let step_name = step_job.step_name.as_str();

        let Some(execution) = repo.get_execution(&workflow_id).await? else {
            return Ok(());
        };
        if execution.status != WorkflowStatus::Running {
            return Ok(());
        }
        let step = repo.get_step(&workflow_id, step_name).await?;
        if step.as_ref().is_some_and(|s| s.status.is_terminal()) {
            return Ok(());
        }
        // A job rescued before its first attempt started has no step row
        if step.is_some() {
            repo.update_step_status(&workflow_id, step_name, StepStatus::Failed, None, Some(reason))
                .await?;
        }

        let optional = self
            .resolve(&step_job.workflow_type, step_name)
            .is_ok_and(|r| !r.step.required);
        warn!(
            workflow_id = %workflow_id,
            step = step_name,
            optional,
            error = reason,
            "step job discarded by the queue"
        );
        if optional {
            self.orchestrator.advance(&workflow_id, step_name, &Map::new()).await?;
        } else {
            self.orchestrator
                .fail_workflow(&workflow_id, Some(step_name), reason)
                .await?;
        }
        Ok(())
    }

    fn resolve(&self, workflow_type: &str, step_name: &str) -> Result<ResolvedStep<'_>, StepError> {
        let registry = self.orchestrator.registry();
        let definition = registry.definition(workflow_type).ok_or_else(|| {
            StepError::configuration(format!("workflow type '{workflow_type}' is not registered"))
        })?;
        let step = definition.step(step_name).ok_or_else(|| {
            StepError::configuration(format!(
                "step '{step_name}' is not defined for workflow '{workflow_type}'"
            ))
        })?;
        let handler = registry.handler(workflow_type, step_name).ok_or_else(|| {
            StepError::configuration(format!("no handler registered for step '{step_name}'"))
        })?;
        Ok(ResolvedStep {
            definition,
            step,
            handler,
        })
    }

    fn policy_for(&self, job: &JobRecord) -> RetryPolicy {
        job.step_job()
            .ok()
            .and_then(|sj| {
                let definition = self.orchestrator.registry().definition(&sj.workflow_type)?;
                let step = definition.step(&sj.step_name)?;
                Some(definition.retry_policy_for(step))
            })
            .unwrap_or_default()
    }

    fn timeout_secs_for(&self, job: &JobRecord) -> u64 {
        job.step_job()
            .ok()
            .and_then(|sj| {
                let definition = self.orchestrator.registry().definition(&sj.workflow_type)?;
                let step = definition.step(&sj.step_name)?;
                Some(definition.timeout_secs_for(step))
            })
            .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS)
    }
}

/// Successful result to output map; `success: false` becomes a step error.
fn into_output(result: StepResult) -> Result<Map<String, Value>, StepError> {
    if result.success {
        return Ok(result.output);
    }
    Err(result
        .into_error()
        .unwrap_or_else(|| StepError::business_logic("step reported failure")))
}

impl<R, Q, H> JobWorker for StepRunner<R, Q, H>
where
    R: WorkflowRepository,
    Q: JobQueue,
    H: ContentHasher,
{
    fn kind(&self) -> &str {
        StepJob::KIND
    }

    async fn work(&self, job: &JobRecord) -> Result<(), JobError> {
        let step_job = job
            .step_job()
            .map_err(|e| JobError::Discard(format!("invalid step job payload: {e}")))?;
        self.run(job, step_job).await
    }

    fn next_retry(&self, job: &JobRecord) -> DateTime<Utc> {
        RetryHandler::next_retry_at(&self.policy_for(job), job.attempt, Utc::now())
    }

    fn timeout(&self, job: &JobRecord) -> Duration {
        Duration::from_secs(self.timeout_secs_for(job)) + QUEUE_TIMEOUT_GRACE
    }

    async fn on_discard(&self, job: &JobRecord, reason: &str) {
        let step_job = match job.step_job() {
            Ok(step_job) => step_job,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "discarded job has no readable step payload");
                return;
            }
        };
        if let Err(e) = self.abandon(&step_job, reason).await {
            error!(
                job_id = job.id,
                workflow_id = %step_job.workflow_id,
                step = %step_job.step_name,
                error = %e,
                "could not record discarded step"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
