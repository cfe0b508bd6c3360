//! Worker pool driving the SQLite job queue.
//!
//! Each configured lane (queue name) gets its own polling loop with a
//! semaphore sized to the lane's worker count. A claimed job runs under the
//! worker's hard timeout, and its result is written back to the queue:
//!
//! - `Ok`                      -> completed
//! - `JobError::Retry`         -> retryable at `next_retry`, or discarded when
//!                                no attempts remain
//! - `JobError::Discard`       -> discarded
//! - timeout elapsed           -> treated as a retryable failure
//!
//! Every discard, including jobs rescued with no attempts left, is reported
//! back through `JobWorker::on_discard`.
//!
//! `drain_once`/`drain_until` run the same path inline without spawning, for
//! one-shot CLI runs and deterministic tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_core::queue::{JobError, JobWorker};
use sagaflow_types::config::EngineConfig;
use sagaflow_types::error::QueueError;
use sagaflow_types::job::JobRecord;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sqlite::queue::{RescueReport, SqliteJobQueue};

/// How often the pool looks for jobs abandoned in `running`.
const RESCUE_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    /// Lane name -> max concurrent jobs.
    pub lanes: BTreeMap<String, u32>,
    pub poll_interval: Duration,
    /// Running jobs older than this are handed back to the queue.
    pub rescue_after: Duration,
}

impl WorkerPoolSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            lanes: config
                .queues
                .iter()
                .filter(|(_, workers)| **workers > 0)
                .map(|(lane, workers)| (lane.clone(), *workers))
                .collect(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            rescue_after: Duration::from_secs(config.job_rescue_after_secs),
        }
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { at: DateTime<Utc> },
    Discarded { reason: String },
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool<W: JobWorker> {
    queue: Arc<SqliteJobQueue>,
    worker: Arc<W>,
    settings: WorkerPoolSettings,
}

impl<W: JobWorker + 'static> WorkerPool<W> {
    pub fn new(queue: Arc<SqliteJobQueue>, worker: Arc<W>, settings: WorkerPoolSettings) -> Self {
        Self {
            queue,
            worker,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerPoolSettings {
        &self.settings
    }

    /// Poll every lane until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            lanes = ?self.settings.lanes,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "worker pool started"
        );

        let mut lanes = JoinSet::new();
        for (lane, workers) in &self.settings.lanes {
            lanes.spawn(run_lane(
                Arc::clone(&self.queue),
                Arc::clone(&self.worker),
                lane.clone(),
                *workers,
                self.settings.poll_interval,
                shutdown.clone(),
            ));
        }
        lanes.spawn(run_rescue(
            Arc::clone(&self.queue),
            Arc::clone(&self.worker),
            self.settings.rescue_after,
            shutdown.clone(),
        ));

        while let Some(result) = lanes.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker lane task panicked");
            }
        }
        info!("worker pool stopped");
    }

    /// Run every job due by `due_by` (or by now, if later) once, lane by
    /// lane, without concurrency. Returns the number of attempts made.
    pub async fn drain_once(&self, due_by: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut attempts = 0;
        for lane in self.settings.lanes.keys() {
            let due_by = due_by.max(Utc::now());
            let jobs = self.queue.fetch_available(lane, u32::MAX, due_by).await?;
            for job in jobs {
                execute_job(&self.queue, self.worker.as_ref(), job).await?;
                attempts += 1;
            }
        }
        Ok(attempts)
    }

    /// Rescue jobs stuck in `running` since before `older_than`.
    pub async fn rescue_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> Result<RescueReport, QueueError> {
        rescue_jobs(&self.queue, self.worker.as_ref(), older_than, now).await
    }

    /// Repeat `drain_once` until nothing is due by `due_by`, including
    /// retries scheduled before then and successors enqueued along the way.
    pub async fn drain_until(&self, due_by: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut total = 0;
        loop {
            let attempts = self.drain_once(due_by).await?;
            if attempts == 0 {
                return Ok(total);
            }
            total += attempts;
        }
    }
}

// ---------------------------------------------------------------------------
// Lane loops
// ---------------------------------------------------------------------------

async fn run_lane<W: JobWorker + 'static>(
    queue: Arc<SqliteJobQueue>,
    worker: Arc<W>,
    lane: String,
    workers: u32,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(workers as usize));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    debug!(queue = %lane, workers, "lane started");

    loop {
        while in_flight.try_join_next().is_some() {}

        let free = semaphore.available_permits() as u32;
        if free > 0 {
            match queue.fetch_available(&lane, free, Utc::now()).await {
                Ok(jobs) => {
                    for job in jobs {
                        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                            break;
                        };
                        let queue = Arc::clone(&queue);
                        let worker = Arc::clone(&worker);
                        in_flight.spawn(async move {
                            let _permit = permit;
                            let job_id = job.id;
                            if let Err(e) = execute_job(&queue, worker.as_ref(), job).await {
                                error!(job_id, error = %e, "failed to record job result");
                            }
                        });
                    }
                }
                Err(e) => error!(queue = %lane, error = %e, "failed to fetch jobs"),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!(queue = %lane, "lane stopped");
}

async fn run_rescue<W: JobWorker + 'static>(
    queue: Arc<SqliteJobQueue>,
    worker: Arc<W>,
    rescue_after: Duration,
    shutdown: CancellationToken,
) {
    let rescue_after = chrono::Duration::from_std(rescue_after).unwrap_or(chrono::Duration::MAX);
    let mut ticker = tokio::time::interval(RESCUE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                let older_than = now.checked_sub_signed(rescue_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
                if let Err(e) = rescue_jobs(&queue, worker.as_ref(), older_than, now).await {
                    error!(error = %e, "job rescue failed");
                }
            }
        }
    }
}

async fn rescue_jobs<W: JobWorker>(
    queue: &SqliteJobQueue,
    worker: &W,
    older_than: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<RescueReport, QueueError> {
    let report = queue.rescue_stuck(older_than, now).await?;
    if report.total() > 0 {
        warn!(
            retried = report.retried,
            discarded = report.discarded.len(),
            "rescued jobs stuck in running"
        );
    }
    for job in &report.discarded {
        if job.kind == worker.kind() {
            let reason = job.last_error.as_deref().unwrap_or_default();
            worker.on_discard(job, reason).await;
        }
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// One attempt
// ---------------------------------------------------------------------------

/// Run one claimed job and write its outcome back to the queue.
pub async fn execute_job<W: JobWorker>(
    queue: &SqliteJobQueue,
    worker: &W,
    job: JobRecord,
) -> Result<JobOutcome, QueueError> {
    if job.kind != worker.kind() {
        let reason = format!("no worker registered for job kind {}", job.kind);
        warn!(job_id = job.id, kind = %job.kind, "discarding job of unknown kind");
        queue.discard(job.id, &reason).await?;
        return Ok(JobOutcome::Discarded { reason });
    }

    let timeout = worker.timeout(&job);
    let result = match tokio::time::timeout(timeout, worker.work(&job)).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Retry(format!(
            "job exceeded its {}s timeout",
            timeout.as_secs()
        ))),
    };

    match result {
        Ok(()) => {
            queue.complete(job.id).await?;
            debug!(job_id = job.id, attempt = job.attempt, "job completed");
            Ok(JobOutcome::Completed)
        }
        Err(JobError::Retry(reason)) if job.has_attempts_left() => {
            let at = worker.next_retry(&job);
            queue.retry(job.id, at, &reason).await?;
            info!(
                job_id = job.id,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                retry_at = %at,
                error = %reason,
                "job scheduled for retry"
            );
            Ok(JobOutcome::Retrying { at })
        }
        Err(JobError::Retry(reason)) | Err(JobError::Discard(reason)) => {
            queue.discard(job.id, &reason).await?;
            warn!(job_id = job.id, attempt = job.attempt, error = %reason, "job discarded");
            worker.on_discard(&job, &reason).await;
            Ok(JobOutcome::Discarded { reason })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
