//! Application state wiring the engine together.
//!
//! The CLI pins the engine to the SQLite adapters and the in-memory signup
//! backend. Users, organizations and billing customers created by the
//! backend live only as long as the process, so `start --run` and
//! `worker` are the useful ways to see a workflow through.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sagaflow_infra::config::{load_engine_config, resolve_data_dir};
use sagaflow_infra::engine::{Engine, signup_registry};
use sagaflow_infra::signup::InMemorySignupBackend;
use sagaflow_infra::sqlite::pool::database_url_in;

/// Shared application state used by every command.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: load config, open the DB, register
    /// workflows.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let backend = Arc::new(InMemorySignupBackend::new());
        let registry = signup_registry(backend, &config.workflow_defaults)?;

        let db_url = format!("{}?mode=rwc", database_url_in(&data_dir));
        let engine = Engine::open(&db_url, config, registry)
            .await
            .context("failed to open the workflow database")?;

        Ok(Self {
            engine: Arc::new(engine),
            data_dir,
        })
    }
}
