//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls queue
//! lanes, workflow defaults, compensation, and background housekeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::{
    QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_EXTERNAL, QUEUE_NOTIFICATION, QUEUE_SCHEDULED,
};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.sagaflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lane used for steps whose definition does not name one.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// How often each lane polls for available jobs, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Run step compensation automatically when a workflow fails.
    #[serde(default = "default_true")]
    pub auto_compensate: bool,

    /// Jobs stuck in `running` longer than this are handed back to the queue.
    #[serde(default = "default_job_rescue_after_secs")]
    pub job_rescue_after_secs: u64,

    /// Max concurrent workers per queue lane.
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, u32>,

    #[serde(default)]
    pub workflow_defaults: WorkflowDefaults,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

fn default_queue() -> String {
    QUEUE_DEFAULT.to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_job_rescue_after_secs() -> u64 {
    3600
}

fn default_queues() -> BTreeMap<String, u32> {
    BTreeMap::from([
        (QUEUE_DEFAULT.to_string(), 100),
        (QUEUE_CRITICAL.to_string(), 50),
        (QUEUE_SCHEDULED.to_string(), 25),
        (QUEUE_NOTIFICATION.to_string(), 25),
        (QUEUE_EXTERNAL.to_string(), 10),
    ])
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_queue: default_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_compensate: true,
            job_rescue_after_secs: default_job_rescue_after_secs(),
            queues: default_queues(),
            workflow_defaults: WorkflowDefaults::default(),
            monitor: MonitorConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

/// Defaults applied to workflow definitions that do not set their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

impl Default for WorkflowDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Stuck-workflow monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Active workflows untouched for longer than this are reported.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    300
}

fn default_stuck_threshold_secs() -> u64 {
    2 * 60 * 60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
        }
    }
}

/// Retention cleanup settings. Off unless enabled explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_days: default_retention_days(),
            interval_secs: default_cleanup_interval_secs(),
        }
    }
}
