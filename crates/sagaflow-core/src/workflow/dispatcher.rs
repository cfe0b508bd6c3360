//! Step dispatcher: turns "run step X of workflow W" into one queue insert.
//!
//! The dispatcher never writes step records. The step runner creates the
//! record when a worker actually picks the job up, so a dispatched job that
//! is lost before it runs leaves no phantom pending row behind.

use std::sync::Arc;

use sagaflow_types::definition::DEFAULT_PRIORITY;
use sagaflow_types::job::{InsertOpts, JobId, StepJob};
use sagaflow_types::retry::RetryPolicy;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::JobQueue;

use super::definition::WorkflowError;
use super::registry::Registry;

/// Everything needed to enqueue one step.
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub workflow_id: Uuid,
    pub workflow_type: &'a str,
    pub step_name: &'a str,
    /// Accumulated workflow context at dispatch time.
    pub workflow_context: Map<String, Value>,
    /// Step-local scratch data.
    pub step_context: Value,
    pub org_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
}

/// Resolves a step's lane, priority and attempt budget, then enqueues it.
pub struct StepDispatcher<Q: JobQueue> {
    registry: Arc<Registry>,
    queue: Arc<Q>,
    default_queue: String,
}

impl<Q: JobQueue> StepDispatcher<Q> {
    pub fn new(registry: Arc<Registry>, queue: Arc<Q>, default_queue: impl Into<String>) -> Self {
        Self {
            registry,
            queue,
            default_queue: default_queue.into(),
        }
    }

    /// Enqueue exactly one job for the requested step.
    ///
    /// A step the registry does not know still gets a job on the default lane
    /// with the default retry budget; the runner reports it as a
    /// configuration failure when it runs.
    pub async fn enqueue(&self, request: DispatchRequest<'_>) -> Result<JobId, WorkflowError> {
        let opts = self.insert_opts(request.workflow_type, request.step_name);
        let job = StepJob {
            workflow_id: request.workflow_id,
            workflow_type: request.workflow_type.to_string(),
            step_name: request.step_name.to_string(),
            org_id: request.org_id.map(str::to_string),
            user_id: request.user_id.map(str::to_string),
            workflow_input: request.workflow_context,
            step_input: request.step_context,
        };

        let job_id = self.queue.insert(&job, &opts).await?;
        debug!(
            workflow_id = %request.workflow_id,
            step = request.step_name,
            queue = %opts.queue,
            job_id,
            "dispatched step"
        );
        Ok(job_id)
    }

    fn insert_opts(&self, workflow_type: &str, step_name: &str) -> InsertOpts {
        let Some(definition) = self.registry.definition(workflow_type) else {
            warn!(workflow_type, step = step_name, "dispatching step of unregistered workflow");
            return self.fallback_opts();
        };
        let Some(step) = definition.step(step_name) else {
            warn!(workflow_type, step = step_name, "dispatching unknown step on default queue");
            return InsertOpts {
                priority: definition.priority,
                ..self.fallback_opts()
            };
        };

        InsertOpts {
            queue: definition.queue_for(step, &self.default_queue).to_string(),
            priority: definition.priority,
            max_attempts: definition.retry_policy_for(step).max_attempts(),
            scheduled_at: None,
        }
    }

    fn fallback_opts(&self) -> InsertOpts {
        InsertOpts {
            queue: self.default_queue.clone(),
            priority: DEFAULT_PRIORITY,
            max_attempts: RetryPolicy::default_policy().max_attempts(),
            scheduled_at: None,
        }
    }
}
