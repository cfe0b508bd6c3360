//! Workflow context helpers: size limits and step input construction.
//!
//! The context itself is the JSON object stored on the execution row; merging
//! lives in `sagaflow_types::workflow::merge_context` so the repository can
//! apply it inside its own write.

use sagaflow_types::step::{StepError, StepInput};
use sagaflow_types::workflow::WorkflowExecution;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of the accumulated context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Size checks
// ---------------------------------------------------------------------------

/// Reject step output that would bloat the context row.
pub fn check_output_size(step_name: &str, output: &Map<String, Value>) -> Result<(), StepError> {
    let size = serialized_len(output)?;
    if size > MAX_STEP_OUTPUT_SIZE {
        return Err(StepError::business_logic(format!(
            "step '{step_name}' output is {size} bytes, exceeding the {MAX_STEP_OUTPUT_SIZE} byte limit"
        )));
    }
    Ok(())
}

/// Reject a merge whose combined context would exceed the total limit.
pub fn check_context_size(context: &Value, output: &Map<String, Value>) -> Result<(), StepError> {
    let size = serialized_len(context)? + serialized_len(output)?;
    if size > MAX_CONTEXT_SIZE {
        return Err(StepError::business_logic(format!(
            "workflow context would grow to {size} bytes, exceeding the {MAX_CONTEXT_SIZE} byte limit"
        )));
    }
    Ok(())
}

fn serialized_len(value: &impl serde::Serialize) -> Result<usize, StepError> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .map_err(|e| StepError::business_logic(format!("step output is not serializable: {e}")))
}

// ---------------------------------------------------------------------------
// StepInput construction
// ---------------------------------------------------------------------------

/// Build the canonical step input from the execution's current context.
pub fn step_input_for(execution: &WorkflowExecution, step_name: &str, step_input: Value) -> StepInput {
    StepInput {
        workflow_id: execution.workflow_id,
        workflow_type: execution.workflow_type.clone(),
        step_name: step_name.to_string(),
        org_id: execution.org_id.clone(),
        user_id: execution.user_id.clone(),
        workflow_input: execution.context_map(),
        step_input,
    }
}
