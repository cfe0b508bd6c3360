//! Step execution contract types.
//!
//! `StepInput` is the canonical envelope every step receives, `StepResult` is
//! what a step returns on success, and `StepError` is a classified failure.
//! The `retryable` flag on `StepError` -- not its kind alone -- decides whether
//! the queue re-invokes the step or the workflow fails immediately.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepInput
// ---------------------------------------------------------------------------

/// Canonical input passed to a step's `execute` and `compensate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The full accumulated workflow context.
    #[serde(default)]
    pub workflow_input: Map<String, Value>,
    /// Step-local scratch data.
    #[serde(default)]
    pub step_input: Value,
}

impl StepInput {
    /// Read a string field from the workflow context.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.workflow_input.get(key).and_then(Value::as_str)
    }

    /// Read a required, non-empty string field from the workflow context.
    ///
    /// A missing field is a non-retryable business-logic error: the step that
    /// should have produced it did not.
    pub fn require_str(&self, key: &str) -> Result<&str, StepError> {
        match self.context_str(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(StepError::business_logic(format!(
                "{key} not found in workflow context"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Output of a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    /// Fields merged into the workflow context.
    #[serde(default)]
    pub output: Map<String, Value>,
    /// Suggested next logical state (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry hint for unsuccessful results.
    #[serde(default)]
    pub should_retry: bool,
}

impl StepResult {
    /// A successful result carrying `output`.
    pub fn ok(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    /// A successful result built from a JSON object literal.
    ///
    /// Non-object values produce an empty output map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::ok(map),
            _ => Self::ok(Map::new()),
        }
    }

    pub fn with_next_state(mut self, state: impl Into<String>) -> Self {
        self.next_state = Some(state.into());
        self
    }

    /// An unsuccessful result without a raised error.
    pub fn failed(error: impl Into<String>, should_retry: bool) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_retry,
            ..Default::default()
        }
    }

    /// Convert an unsuccessful result into the equivalent `StepError`.
    pub fn into_error(self) -> Option<StepError> {
        if self.success {
            return None;
        }
        let message = self
            .error
            .unwrap_or_else(|| "step reported failure".to_string());
        Some(StepError::business_logic(message).with_retryable(self.should_retry))
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Validation,
    Network,
    Database,
    ExternalService,
    BusinessLogic,
    Timeout,
    Permission,
    Configuration,
}

impl StepErrorKind {
    /// Whether errors of this kind are retried unless the step says otherwise.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            StepErrorKind::Network | StepErrorKind::Database | StepErrorKind::ExternalService
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepErrorKind::Validation => "validation",
            StepErrorKind::Network => "network",
            StepErrorKind::Database => "database",
            StepErrorKind::ExternalService => "external_service",
            StepErrorKind::BusinessLogic => "business_logic",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::Permission => "permission",
            StepErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified step failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    /// Authoritative for retry scheduling.
    pub retryable: bool,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StepError {
    /// Create an error with the kind's default retryability.
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Network, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Database, message)
    }

    pub fn external_service(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::ExternalService, message)
    }

    pub fn business_logic(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::BusinessLogic, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Timeout, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Permission, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Configuration, message)
    }

    /// Override the kind's default retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
