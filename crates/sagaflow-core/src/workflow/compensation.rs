//! Reverse-order compensation of completed steps.
//!
//! Walks a workflow's completed step records from the last to the first and
//! invokes each handler's `compensate`. A failing compensation is logged and
//! recorded; the walk always continues to the earlier steps.

use sagaflow_types::step::StepInput;
use sagaflow_types::workflow::{StepStatus, WorkflowExecution, WorkflowStep};
use serde::Serialize;
use tracing::{error, info, warn};

use super::context::step_input_for;
use super::registry::Registry;

/// Outcome of one compensation walk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompensationReport {
    /// Steps whose compensation succeeded, in the order they were undone.
    pub compensated: Vec<String>,
    /// Steps whose compensation returned an error.
    pub failed: Vec<CompensationFailure>,
    /// Completed steps with no registered handler.
    pub skipped: Vec<String>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
}

/// Compensate every `completed` step of `execution`, newest first.
pub async fn run_compensation(
    registry: &Registry,
    execution: &WorkflowExecution,
    steps: &[WorkflowStep],
) -> CompensationReport {
    let mut completed: Vec<&WorkflowStep> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .collect();
    completed.sort_by(|a, b| b.step_order.cmp(&a.step_order));

    let mut report = CompensationReport::default();
    for step in completed {
        let Some(handler) = registry.handler(&execution.workflow_type, &step.step_name) else {
            warn!(
                workflow_id = %execution.workflow_id,
                step = %step.step_name,
                "no handler to compensate step"
            );
            report.skipped.push(step.step_name.clone());
            continue;
        };

        let input: StepInput = step_input_for(execution, &step.step_name, serde_json::Value::Null);
        match handler.compensate(&input).await {
            Ok(()) => {
                info!(
                    workflow_id = %execution.workflow_id,
                    step = %step.step_name,
                    "compensated step"
                );
                report.compensated.push(step.step_name.clone());
            }
            Err(e) => {
                error!(
                    workflow_id = %execution.workflow_id,
                    step = %step.step_name,
                    error = %e,
                    "step compensation failed"
                );
                report.failed.push(CompensationFailure {
                    step: step.step_name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticStep, sample_execution, sample_step};
    use sagaflow_types::definition::{StepDefinition, WorkflowDefinition};
    use sagaflow_types::step::StepError;
    use serde_json::json;

    fn registry(a: StaticStep, b: StaticStep, c: StaticStep) -> Registry {
        let mut registry = Registry::new();
        registry
            .register(WorkflowDefinition::new(
                "wf",
                vec![
                    StepDefinition::new("a").then("b"),
                    StepDefinition::new("b").then("c"),
                    StepDefinition::new("c"),
                ],
            ))
            .unwrap();
        registry.register_handler("wf", "a", a).unwrap();
        registry.register_handler("wf", "b", b).unwrap();
        registry.register_handler("wf", "c", c).unwrap();
        registry
    }

    #[tokio::test]
    async fn compensates_completed_steps_in_reverse() {
        let (a, b, c) = (StaticStep::empty(), StaticStep::empty(), StaticStep::empty());
        let registry = registry(a.clone(), b.clone(), c.clone());
        let execution = sample_execution(json!({"user_id": "u1"}));
        let steps = vec![
            sample_step(&execution, "a", 0, StepStatus::Completed),
            sample_step(&execution, "b", 1, StepStatus::Completed),
            sample_step(&execution, "c", 2, StepStatus::Failed),
        ];

        let report = run_compensation(&registry, &execution, &steps).await;
        assert_eq!(report.compensated, vec!["b".to_string(), "a".to_string()]);
        assert!(report.is_clean());
        assert_eq!(a.compensations(), 1);
        assert_eq!(b.compensations(), 1);
        assert_eq!(c.compensations(), 0);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_walk() {
        let b = StaticStep::empty().compensate_error(StepError::external_service("stripe down"));
        let a = StaticStep::empty();
        let registry = registry(a.clone(), b, StaticStep::empty());
        let execution = sample_execution(json!({}));
        let steps = vec![
            sample_step(&execution, "a", 0, StepStatus::Completed),
            sample_step(&execution, "b", 1, StepStatus::Completed),
        ];

        let report = run_compensation(&registry, &execution, &steps).await;
        assert_eq!(report.compensated, vec!["a".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].step, "b");
        assert!(report.failed[0].error.contains("stripe down"));
        assert!(!report.is_clean());
        assert_eq!(a.compensations(), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_skipped() {
        let registry = Registry::new();
        let execution = sample_execution(json!({}));
        let steps = vec![sample_step(&execution, "a", 0, StepStatus::Completed)];

        let report = run_compensation(&registry, &execution, &steps).await;
        assert_eq!(report.skipped, vec!["a".to_string()]);
        assert!(report.compensated.is_empty());
    }
}
