//! Workflow error type and definition validation.
//!
//! Validates structural constraints of a `WorkflowDefinition` before it is
//! registered: a non-empty name, at least one step, unique step names, and
//! successor references that resolve within the same workflow.

use std::collections::HashSet;

use sagaflow_types::error::{QueueError, RepositoryError};
use sagaflow_types::definition::WorkflowDefinition;
use sagaflow_types::workflow::WorkflowStatus;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No definition is registered for the type, or it has no steps.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),

    /// No execution with this ID exists.
    #[error("workflow {0} not found")]
    NotFound(Uuid),

    /// A step name does not resolve within its workflow.
    #[error("step '{step}' is not defined for workflow '{workflow_type}'")]
    StepNotFound { workflow_type: String, step: String },

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A definition with this name is already registered.
    #[error("workflow '{0}' is already registered")]
    DuplicateDefinition(String),

    /// The start input is not usable as a workflow context.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested status change is not allowed from the current status.
    #[error("cannot move workflow {workflow_id} from {from} to {to}")]
    InvalidTransition {
        workflow_id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a `WorkflowDefinition` for structural correctness.
///
/// Checks:
/// - Workflow name is non-empty and contains no whitespace.
/// - At least one step.
/// - Step names are non-empty and unique.
/// - Every `next_steps` entry names a step in the same workflow.
/// - No step lists itself as a successor.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.name.chars().any(char::is_whitespace) {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' must not contain whitespace",
            def.name
        )));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "workflow '{}' has no steps",
            def.name
        )));
    }

    let mut names = HashSet::new();
    for step in &def.steps {
        if step.name.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step name must not be empty".to_string(),
            ));
        }
        if !names.insert(step.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step name: '{}'",
                step.name
            )));
        }
    }

    for step in &def.steps {
        for next in &step.next_steps {
            if next == &step.name {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' lists itself as a successor",
                    step.name
                )));
            }
            if !names.contains(next.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' references unknown successor '{}'",
                    step.name, next
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::definition::StepDefinition;

    fn linear(names: &[&str]) -> WorkflowDefinition {
        let steps = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let step = StepDefinition::new(*name);
                match names.get(i + 1) {
                    Some(next) => step.then(*next),
                    None => step,
                }
            })
            .collect();
        WorkflowDefinition::new("wf", steps)
    }

    #[test]
    fn valid_linear_definition() {
        assert!(validate_definition(&linear(&["a", "b", "c"])).is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        let mut def = linear(&["a"]);
        def.name = String::new();
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::ValidationError(_))
        ));

        def.name = "user signup".to_string();
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn rejects_no_steps() {
        let def = WorkflowDefinition::new("wf", vec![]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![StepDefinition::new("a"), StepDefinition::new("a")],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn rejects_unknown_successor() {
        let def = WorkflowDefinition::new("wf", vec![StepDefinition::new("a").then("ghost")]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_self_successor() {
        let def = WorkflowDefinition::new("wf", vec![StepDefinition::new("a").then("a")]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn error_display() {
        let err = WorkflowError::UnknownWorkflow("nope".to_string());
        assert_eq!(err.to_string(), "unknown workflow type: nope");

        let err = WorkflowError::InvalidTransition {
            workflow_id: Uuid::nil(),
            from: WorkflowStatus::Completed,
            to: WorkflowStatus::Cancelled,
        };
        assert!(err.to_string().contains("from completed to cancelled"));
    }
}
