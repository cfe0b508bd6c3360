//! Workflow definition and step handler registry.
//!
//! Built once at process start, then shared read-only (behind `Arc`) by the
//! orchestrator, the step dispatcher, and the step runner.

use std::collections::HashMap;

use sagaflow_types::definition::{StepDefinition, WorkflowDefinition};
use tracing::debug;

use super::definition::{WorkflowError, validate_definition};
use super::handler::{BoxStepHandler, StepHandler};

/// Maps workflow type names to definitions, and (type, step) pairs to the
/// handlers that execute them.
#[derive(Debug, Default)]
pub struct Registry {
    definitions: HashMap<String, WorkflowDefinition>,
    handlers: HashMap<String, HashMap<String, BoxStepHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition.
    ///
    /// Fails if the definition is structurally invalid or its name is taken.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        validate_definition(&definition)?;
        if self.definitions.contains_key(&definition.name) {
            return Err(WorkflowError::DuplicateDefinition(definition.name));
        }
        debug!(
            workflow_type = %definition.name,
            steps = definition.steps.len(),
            "registered workflow definition"
        );
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Attach the handler for one step of a registered workflow.
    ///
    /// Registering a second handler for the same step replaces the first.
    pub fn register_handler<H: StepHandler + 'static>(
        &mut self,
        workflow_type: &str,
        step_name: &str,
        handler: H,
    ) -> Result<(), WorkflowError> {
        let definition = self
            .definitions
            .get(workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_type.to_string()))?;
        if definition.step(step_name).is_none() {
            return Err(WorkflowError::StepNotFound {
                workflow_type: workflow_type.to_string(),
                step: step_name.to_string(),
            });
        }
        self.handlers
            .entry(workflow_type.to_string())
            .or_default()
            .insert(step_name.to_string(), BoxStepHandler::new(handler));
        Ok(())
    }

    pub fn definition(&self, workflow_type: &str) -> Option<&WorkflowDefinition> {
        self.definitions.get(workflow_type)
    }

    /// Definition lookup for starting or restarting a workflow.
    ///
    /// A definition without steps is treated as unknown.
    pub fn require_definition(&self, workflow_type: &str) -> Result<&WorkflowDefinition, WorkflowError> {
        self.definitions
            .get(workflow_type)
            .filter(|def| !def.steps.is_empty())
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_type.to_string()))
    }

    pub fn step(&self, workflow_type: &str, step_name: &str) -> Option<&StepDefinition> {
        self.definitions.get(workflow_type)?.step(step_name)
    }

    pub fn handler(&self, workflow_type: &str, step_name: &str) -> Option<&BoxStepHandler> {
        self.handlers.get(workflow_type)?.get(step_name)
    }

    /// Registered workflow type names, sorted.
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Steps that are defined but have no handler, as `(workflow_type, step)`.
    pub fn missing_handlers(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in self.workflow_types() {
            let Some(def) = self.definitions.get(name) else {
                continue;
            };
            for step in &def.steps {
                if self.handler(name, &step.name).is_none() {
                    missing.push((name.to_string(), step.name.clone()));
                }
            }
        }
        missing
    }

    /// Fail if any defined step lacks a handler.
    pub fn ensure_complete(&self) -> Result<(), WorkflowError> {
        match self.missing_handlers().into_iter().next() {
            None => Ok(()),
            Some((workflow_type, step)) => Err(WorkflowError::ValidationError(format!(
                "no handler registered for step '{step}' of workflow '{workflow_type}'"
            ))),
        }
    }
}
