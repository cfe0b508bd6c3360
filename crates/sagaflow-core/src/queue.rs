//! Job queue ports.
//!
//! The durable, at-least-once job queue is an external collaborator. Core
//! depends on two narrow traits:
//! - `JobQueue` -- the insert side used by the step dispatcher.
//! - `JobWorker` -- the execution side the queue calls for each job of a kind,
//!   plus the retry schedule and hard timeout the queue consults.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_types::error::QueueError;
use sagaflow_types::job::{InsertOpts, JobId, JobRecord, StepJob};

/// Insert side of the job queue.
pub trait JobQueue: Send + Sync {
    /// Enqueue a step job. Exactly one row per call; at-least-once delivery.
    fn insert(
        &self,
        job: &StepJob,
        opts: &InsertOpts,
    ) -> impl std::future::Future<Output = Result<JobId, QueueError>> + Send;
}

/// What a worker tells the queue when a job does not complete.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Re-run the job at `JobWorker::next_retry` if attempts remain.
    #[error("retryable job failure: {0}")]
    Retry(String),

    /// Finalize the job without further attempts.
    #[error("job discarded: {0}")]
    Discard(String),
}

/// Execution side of the job queue.
pub trait JobWorker: Send + Sync {
    /// Job kind this worker handles.
    fn kind(&self) -> &str;

    /// Run one attempt of a job.
    fn work(
        &self,
        job: &JobRecord,
    ) -> impl std::future::Future<Output = Result<(), JobError>> + Send;

    /// When the next attempt should run after a `JobError::Retry`.
    fn next_retry(&self, job: &JobRecord) -> DateTime<Utc>;

    /// Hard limit on one attempt, enforced by the queue.
    fn timeout(&self, job: &JobRecord) -> Duration;

    /// Called once the queue has finalized `job` as discarded, whether the
    /// worker asked for it, attempts ran out, or the job was rescued with no
    /// attempts left.
    fn on_discard(&self, _job: &JobRecord, _reason: &str) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}
