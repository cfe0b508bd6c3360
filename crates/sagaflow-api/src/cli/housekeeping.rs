//! CLI housekeeping: stuck-workflow report and retention cleanup.

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;

use super::workflow::executions_table;
use crate::state::AppState;

pub async fn stuck(state: &AppState, json: bool) -> Result<()> {
    let stuck = state
        .engine
        .monitor()
        .scan()
        .await
        .context("Failed to scan for stuck workflows")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stuck)?);
        return Ok(());
    }

    println!();
    if stuck.is_empty() {
        println!(
            "  {} No stuck workflows (threshold {}s).",
            style("✓").green(),
            state.engine.config().monitor.stuck_threshold_secs
        );
    } else {
        println!(
            "  {} {} workflow(s) have not progressed in {}s",
            style("!").yellow().bold(),
            stuck.len(),
            state.engine.config().monitor.stuck_threshold_secs
        );
        println!();
        println!("{}", executions_table(&stuck));
    }
    println!();

    Ok(())
}

pub async fn cleanup(state: &AppState, json: bool) -> Result<()> {
    let report = state
        .engine
        .cleanup()
        .run_once(Utc::now())
        .await
        .context("Retention cleanup failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Removed {} workflow(s) and {} job(s) older than {} days",
        style("*").green().bold(),
        report.workflows_deleted,
        report.jobs_deleted,
        state.engine.config().cleanup.retention_days
    );
    println!();

    Ok(())
}
