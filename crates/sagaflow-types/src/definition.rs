//! Workflow and step definitions.
//!
//! A `WorkflowDefinition` is registered once at startup and is immutable at
//! runtime. It names a workflow type and lists its steps; each step names the
//! queue lane it runs on, its timeout, its retry policy, and the successor
//! steps to dispatch when it succeeds.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Queue lanes
// ---------------------------------------------------------------------------

pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_SCHEDULED: &str = "scheduled";
pub const QUEUE_NOTIFICATION: &str = "notification";
pub const QUEUE_EXTERNAL: &str = "external";

/// Default job priority (1 is the highest).
pub const DEFAULT_PRIORITY: i16 = 1;

/// Default step timeout when neither the step nor the workflow sets one (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A registered workflow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow type name (e.g. "user_signup"). Unique across the registry.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered steps. The first entry is the entry point.
    pub steps: Vec<StepDefinition>,
    /// Queue lane for steps that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_queue: Option<String>,
    /// Timeout for steps that do not set one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Retry budget for steps without their own policy.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Priority of every job dispatched for this workflow.
    #[serde(default = "default_priority")]
    pub priority: i16,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    3
}

fn default_priority() -> i16 {
    DEFAULT_PRIORITY
}

impl WorkflowDefinition {
    /// Create a definition with workflow-level defaults.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            default_queue: None,
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            priority: default_priority(),
        }
    }

    /// The entry step, if the workflow has any steps.
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Zero-based position of a step in the definition.
    pub fn step_order(&self, name: &str) -> Option<u32> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .map(|idx| idx as u32)
    }

    /// Resolve the queue lane for a step, falling back to the workflow default
    /// and then to `fallback`.
    pub fn queue_for<'a>(&'a self, step: &'a StepDefinition, fallback: &'a str) -> &'a str {
        step.queue
            .as_deref()
            .or(self.default_queue.as_deref())
            .unwrap_or(fallback)
    }

    /// Resolve a step's timeout in seconds.
    pub fn timeout_secs_for(&self, step: &StepDefinition) -> u64 {
        step.timeout_secs.unwrap_or(self.default_timeout_secs)
    }

    /// Resolve a step's retry policy.
    pub fn retry_policy_for(&self, step: &StepDefinition) -> RetryPolicy {
        step.retry.clone().unwrap_or_else(|| RetryPolicy {
            max_retries: self.default_max_retries,
            ..RetryPolicy::default_policy()
        })
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name. Unique within its workflow.
    pub name: String,
    /// Queue lane (falls back to the workflow or engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy (falls back to the workflow default budget).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Steps to dispatch when this one succeeds. Empty marks a leaf.
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// When false, the workflow proceeds past this step even if it ultimately fails.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl StepDefinition {
    /// A required step with no overrides and no successors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            timeout_secs: None,
            retry: None,
            next_steps: Vec::new(),
            required: true,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Append a successor step.
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next_steps.push(next.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Whether this step ends its branch.
    pub fn is_leaf(&self) -> bool {
        self.next_steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
