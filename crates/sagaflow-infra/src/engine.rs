//! Engine wiring.
//!
//! Builds the SQLite-backed orchestrator, step runner, worker pool, monitor
//! and cleanup task from an `EngineConfig` and a populated `Registry`.

use std::sync::Arc;

use sagaflow_core::signup::{self, SignupBackend};
use sagaflow_core::workflow::definition::WorkflowError;
use sagaflow_core::workflow::monitor::StuckWorkflowMonitor;
use sagaflow_core::workflow::orchestrator::{Orchestrator, OrchestratorSettings};
use sagaflow_core::workflow::registry::Registry;
use sagaflow_core::workflow::runner::StepRunner;
use sagaflow_types::config::{EngineConfig, WorkflowDefaults};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::crypto::hash::Sha256ContentHasher;
use crate::sqlite::cleanup::RetentionCleanup;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::queue::SqliteJobQueue;
use crate::sqlite::workflow::SqliteWorkflowRepository;
use crate::worker::pool::{WorkerPool, WorkerPoolSettings};

pub type SqliteOrchestrator = Orchestrator<SqliteWorkflowRepository, SqliteJobQueue, Sha256ContentHasher>;
pub type SqliteStepRunner = StepRunner<SqliteWorkflowRepository, SqliteJobQueue, Sha256ContentHasher>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// A registry holding the `user_signup` workflow over `backend`.
pub fn signup_registry<B: SignupBackend + 'static>(
    backend: Arc<B>,
    defaults: &WorkflowDefaults,
) -> Result<Registry, WorkflowError> {
    let mut registry = Registry::new();
    signup::register(&mut registry, backend, defaults)?;
    Ok(registry)
}

/// The assembled engine. Cheap handles are shared through `Arc`s.
pub struct Engine {
    config: EngineConfig,
    pool: DatabasePool,
    repository: Arc<SqliteWorkflowRepository>,
    queue: Arc<SqliteJobQueue>,
    orchestrator: Arc<SqliteOrchestrator>,
}

impl Engine {
    /// Open the database, run migrations, and wire the orchestrator.
    ///
    /// Fails if any registered step lacks a handler.
    pub async fn open(database_url: &str, config: EngineConfig, registry: Registry) -> Result<Self, EngineError> {
        registry.ensure_complete()?;

        let pool = DatabasePool::new(database_url).await?;
        let repository = Arc::new(SqliteWorkflowRepository::new(pool.clone()));
        let queue = Arc::new(SqliteJobQueue::new(pool.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&repository),
            Arc::clone(&queue),
            Arc::new(registry),
            Arc::new(Sha256ContentHasher::new()),
            OrchestratorSettings::from_config(&config),
        ));

        info!(
            workflows = ?orchestrator.registry().workflow_types(),
            auto_compensate = config.auto_compensate,
            "engine opened"
        );
        Ok(Self {
            config,
            pool,
            repository,
            queue,
            orchestrator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn orchestrator(&self) -> &Arc<SqliteOrchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<SqliteJobQueue> {
        &self.queue
    }

    pub fn worker_pool(&self) -> WorkerPool<SqliteStepRunner> {
        WorkerPool::new(
            Arc::clone(&self.queue),
            Arc::new(StepRunner::new(Arc::clone(&self.orchestrator))),
            WorkerPoolSettings::from_config(&self.config),
        )
    }

    pub fn monitor(&self) -> StuckWorkflowMonitor<SqliteWorkflowRepository> {
        StuckWorkflowMonitor::from_config(Arc::clone(&self.repository), &self.config.monitor)
    }

    pub fn cleanup(&self) -> RetentionCleanup {
        RetentionCleanup::new(self.pool.clone(), &self.config.cleanup)
    }

    /// Run the worker pool, plus the monitor and cleanup when enabled, until
    /// `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut background = tokio::task::JoinSet::new();
        if self.config.monitor.enabled {
            background.spawn(self.monitor().run(shutdown.clone()));
        }
        if self.config.cleanup.enabled {
            background.spawn(self.cleanup().run(shutdown.clone()));
        }

        self.worker_pool().run(shutdown).await;

        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "background task panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
