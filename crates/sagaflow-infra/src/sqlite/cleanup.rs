//! Retention cleanup for finished workflows and jobs.
//!
//! Deletes terminal executions (their step records cascade) and finalized
//! jobs older than the retention window. Active workflows and unfinished
//! jobs are never touched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_types::config::CleanupConfig;
use sagaflow_types::error::RepositoryError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::format_datetime;
use super::pool::DatabasePool;

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub workflows_deleted: u64,
    pub jobs_deleted: u64,
}

pub struct RetentionCleanup {
    pool: DatabasePool,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionCleanup {
    pub fn new(pool: DatabasePool, config: &CleanupConfig) -> Self {
        Self {
            pool,
            retention: chrono::Duration::days(i64::from(config.retention_days)),
            interval: Duration::from_secs(config.interval_secs.max(1)),
        }
    }

    /// Delete everything that finished before `now - retention`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport, RepositoryError> {
        let cutoff = format_datetime(&(now - self.retention));

        let workflows = sqlx::query(
            r#"DELETE FROM workflow_executions
               WHERE status IN ('completed', 'failed', 'cancelled')
                 AND completed_at IS NOT NULL
                 AND completed_at < ?"#,
        )
        .bind(&cutoff)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let jobs = sqlx::query(
            r#"DELETE FROM jobs
               WHERE state IN ('completed', 'discarded')
                 AND finalized_at IS NOT NULL
                 AND finalized_at < ?"#,
        )
        .bind(&cutoff)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let report = CleanupReport {
            workflows_deleted: workflows.rows_affected(),
            jobs_deleted: jobs.rows_affected(),
        };
        info!(
            workflows_deleted = report.workflows_deleted,
            jobs_deleted = report.jobs_deleted,
            cutoff = %cutoff,
            "retention cleanup finished"
        );
        Ok(report)
    }

    /// Run a pass every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "retention cleanup failed");
                    }
                }
            }
        }
    }
}
