//! CLI worker command.
//!
//! `sagaflow worker` runs the per-lane worker pool, the stuck-workflow
//! monitor and retention cleanup until Ctrl-C. `--once` drains every due
//! job in the foreground and exits.

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::AppState;

pub async fn run(state: &AppState, once: bool, json: bool) -> Result<()> {
    if once {
        return drain(state, json).await;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down workers");
            signal.cancel();
        }
    });

    if !json {
        let lanes = state.engine.config().queues.len();
        println!();
        println!(
            "  {} Worker running on {} queue lanes ({})",
            style("*").green().bold(),
            lanes,
            style(state.data_dir.display()).dim()
        );
        println!("  Press Ctrl-C to stop.");
        println!();
    }

    state.engine.run(shutdown).await;

    if json {
        println!("{}", serde_json::json!({"stopped": true}));
    } else {
        println!("  Worker stopped.");
    }
    Ok(())
}

async fn drain(state: &AppState, json: bool) -> Result<()> {
    let attempts = state
        .engine
        .worker_pool()
        .drain_until(Utc::now())
        .await
        .context("Failed to process queued jobs")?;

    if json {
        println!("{}", serde_json::json!({"attempts": attempts}));
    } else {
        println!();
        println!(
            "  {} Processed {} job attempt(s)",
            style("*").green().bold(),
            attempts
        );
        println!();
    }
    Ok(())
}
