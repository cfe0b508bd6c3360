//! Stuck-workflow monitor.
//!
//! Reports active executions whose row has not changed for longer than a
//! threshold: typically a workflow whose next job was never enqueued, or a
//! step that keeps being rescued. The monitor only logs and reports; it does
//! not repair anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sagaflow_types::config::MonitorConfig;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::WorkflowExecution;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::repository::workflow::WorkflowRepository;

pub struct StuckWorkflowMonitor<R: WorkflowRepository> {
    repo: Arc<R>,
    threshold: Duration,
    interval: Duration,
}

impl<R: WorkflowRepository> StuckWorkflowMonitor<R> {
    pub fn new(repo: Arc<R>, threshold: Duration, interval: Duration) -> Self {
        Self {
            repo,
            threshold,
            interval,
        }
    }

    pub fn from_config(repo: Arc<R>, config: &MonitorConfig) -> Self {
        Self::new(
            repo,
            Duration::from_secs(config.stuck_threshold_secs),
            Duration::from_secs(config.interval_secs),
        )
    }

    /// Find and log active workflows untouched for longer than the threshold.
    pub async fn scan(&self) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let threshold = chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::MAX);
        let older_than = Utc::now()
            .checked_sub_signed(threshold)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let stuck = self.repo.list_stale_active(older_than).await?;
        for execution in &stuck {
            warn!(
                workflow_id = %execution.workflow_id,
                workflow_type = %execution.workflow_type,
                status = %execution.status,
                current_step = ?execution.current_step,
                updated_at = %execution.updated_at,
                "workflow appears stuck"
            );
        }
        debug!(count = stuck.len(), "stuck workflow scan finished");
        Ok(stuck)
    }

    /// Scan every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "stuck workflow monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "stuck workflow scan failed");
                    }
                }
            }
        }
        info!("stuck workflow monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRepository;
    use crate::testing::sample_execution;
    use sagaflow_types::workflow::WorkflowStatus;
    use serde_json::json;

    #[tokio::test]
    async fn reports_only_stale_active_workflows() {
        let repo = Arc::new(InMemoryRepository::default());

        let mut stale = sample_execution(json!({}));
        stale.updated_at = Utc::now() - chrono::Duration::hours(3);
        let stale_id = stale.workflow_id;
        repo.put_execution(stale);

        let mut stale_done = sample_execution(json!({}));
        stale_done.status = WorkflowStatus::Completed;
        stale_done.updated_at = Utc::now() - chrono::Duration::hours(3);
        repo.put_execution(stale_done);

        repo.put_execution(sample_execution(json!({})));

        let monitor = StuckWorkflowMonitor::from_config(Arc::clone(&repo), &MonitorConfig::default());
        let stuck = monitor.scan().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].workflow_id, stale_id);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let repo = Arc::new(InMemoryRepository::default());
        let monitor = StuckWorkflowMonitor::new(repo, Duration::from_secs(60), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
