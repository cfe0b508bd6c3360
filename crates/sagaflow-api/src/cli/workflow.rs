//! CLI workflow subcommands.
//!
//! Provides start, status, steps, progress, list, cancel, restart, and
//! compensate operations on workflow executions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use sagaflow_types::workflow::{ExecutionFilter, StepStatus, WorkflowExecution, WorkflowStatus};

use super::{StatusArg, parse_workflow_id, short_id};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn start(
    state: &AppState,
    workflow_type: &str,
    input: Option<&str>,
    org_id: Option<&str>,
    user_id: Option<&str>,
    run: bool,
    json: bool,
) -> Result<()> {
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input must be valid JSON")?,
        None => Value::Null,
    };

    let orchestrator = state.engine.orchestrator();
    let workflow_id = orchestrator
        .start_workflow(workflow_type, input, org_id, user_id)
        .await
        .with_context(|| format!("Failed to start workflow '{workflow_type}'"))?;

    if run {
        state
            .engine
            .worker_pool()
            .drain_until(Utc::now())
            .await
            .context("Failed to process queued jobs")?;
    }

    let execution = orchestrator.get_workflow_status(&workflow_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Started {} workflow {}",
        style("*").green().bold(),
        style(workflow_type).cyan(),
        style(workflow_id).cyan()
    );
    println!("  Status: {}", execution.status);
    if let Some(ref step) = execution.current_step {
        println!("  Current step: {step}");
    }
    if let Some(ref err) = execution.error_message {
        println!("  Error: {}", style(err).red());
    }
    if !run && execution.status == WorkflowStatus::Running {
        println!(
            "  Process it with: {}",
            style("sagaflow worker --once").dim()
        );
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let execution = state
        .engine
        .orchestrator()
        .get_workflow_status(&id)
        .await
        .with_context(|| format!("Workflow '{workflow_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    display_execution(&execution);
    Ok(())
}

fn display_execution(execution: &WorkflowExecution) {
    println!();
    println!(
        "  {} {}",
        style("Workflow:").bold(),
        style(execution.workflow_id).cyan()
    );
    println!("  Type: {}", execution.workflow_type);
    println!("  Status: {}", execution.status);
    if let Some(ref step) = execution.current_step {
        println!("  Current step: {step}");
    }
    if let Some(ref org) = execution.org_id {
        println!("  Org: {org}");
    }
    if let Some(ref user) = execution.user_id {
        println!("  User: {user}");
    }
    println!("  Started: {}", format_time(execution.started_at));
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", format_time(completed));
    }
    if execution.retry_count > 0 {
        println!("  Restarts: {}", execution.retry_count);
    }
    if let Some(ref err) = execution.error_message {
        println!("  Error: {}", style(err).red());
    }
    if let Value::Object(ref ctx) = execution.context {
        let keys: Vec<&str> = ctx.keys().map(String::as_str).collect();
        println!("  Context keys: {}", keys.join(", "));
    }
    println!();
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

pub async fn steps(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let steps = state
        .engine
        .orchestrator()
        .get_workflow_steps(&id)
        .await
        .with_context(|| format!("Failed to list steps of '{workflow_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!();
        println!("  No steps recorded for workflow '{workflow_id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Status"),
            Cell::new("Queue"),
            Cell::new("Retries"),
            Cell::new("Job"),
            Cell::new("Error"),
        ]);

    for s in &steps {
        table.add_row(vec![
            Cell::new(s.step_order),
            Cell::new(&s.step_name),
            format_step_status(s.status),
            Cell::new(s.queue_name.as_deref().unwrap_or("-")),
            Cell::new(format!("{}/{}", s.retry_count, s.max_retries)),
            Cell::new(s.job_id.map(|j| j.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(s.error_message.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

pub async fn progress(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let summary = state
        .engine
        .orchestrator()
        .get_workflow_summary(&id)
        .await
        .with_context(|| format!("Workflow '{workflow_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary.progress)?);
        return Ok(());
    }

    let p = summary.progress;
    println!();
    println!(
        "  {} {}/{} steps completed ({:.0}%)",
        style(short_id(&id)).cyan(),
        p.completed_steps,
        p.total_steps,
        p.ratio * 100.0
    );
    println!("  Status: {}", summary.execution.status);
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(
    state: &AppState,
    status: Option<StatusArg>,
    workflow_type: Option<String>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let filter = ExecutionFilter {
        status: status.map(WorkflowStatus::from),
        workflow_type,
        limit,
    };
    let executions = state
        .engine
        .orchestrator()
        .list_workflows(&filter)
        .await
        .context("Failed to list workflows")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No workflows found.");
        println!(
            "  Start one with: {}",
            style("sagaflow start --input '{...}'").dim()
        );
        println!();
        return Ok(());
    }

    println!();
    println!("{}", executions_table(&executions));
    println!();

    Ok(())
}

/// Table of executions shared with the `stuck` command.
pub fn executions_table(executions: &[WorkflowExecution]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Started"),
            Cell::new("Updated"),
        ]);

    for e in executions {
        table.add_row(vec![
            Cell::new(short_id(&e.workflow_id)),
            Cell::new(&e.workflow_type),
            format_status(e.status),
            Cell::new(e.current_step.as_deref().unwrap_or("-")),
            Cell::new(format_time(e.started_at)),
            Cell::new(format_time(e.updated_at)),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Cancel / restart / compensate
// ---------------------------------------------------------------------------

pub async fn cancel(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    state
        .engine
        .orchestrator()
        .cancel_workflow(&id)
        .await
        .with_context(|| format!("Failed to cancel workflow '{workflow_id}'"))?;

    if json {
        println!(
            "{}",
            serde_json::json!({"workflow_id": id.to_string(), "status": "cancelled"})
        );
    } else {
        println!();
        println!(
            "  {} Cancelled workflow '{}'",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
        println!();
    }

    Ok(())
}

pub async fn restart(
    state: &AppState,
    workflow_id: &str,
    from_step: Option<&str>,
    json: bool,
) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let orchestrator = state.engine.orchestrator();
    orchestrator
        .restart_workflow(&id, from_step)
        .await
        .with_context(|| format!("Failed to restart workflow '{workflow_id}'"))?;
    let execution = orchestrator.get_workflow_status(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        println!();
        println!(
            "  {} Restarted workflow '{}' from {}",
            style("*").green().bold(),
            style(short_id(&id)).cyan(),
            style(execution.current_step.as_deref().unwrap_or("-")).cyan()
        );
        println!("  Restarts: {}", execution.retry_count);
        println!();
    }

    Ok(())
}

pub async fn compensate(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let id = parse_workflow_id(workflow_id)?;
    let report = state
        .engine
        .orchestrator()
        .compensate(&id)
        .await
        .with_context(|| format!("Failed to compensate workflow '{workflow_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    if report.compensated.is_empty() && report.failed.is_empty() {
        println!("  Nothing to compensate for '{}'.", style(short_id(&id)).cyan());
    }
    for step in &report.compensated {
        println!("  {} {step}", style("✓").green());
    }
    for failure in &report.failed {
        println!(
            "  {} {}: {}",
            style("✗").red(),
            failure.step,
            style(&failure.error).red()
        );
    }
    for step in &report.skipped {
        println!("  {} {step} (no handler)", style("-").dim());
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_status(status: WorkflowStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        WorkflowStatus::Pending => cell.fg(Color::Yellow),
        WorkflowStatus::Running => cell.fg(Color::Blue),
        WorkflowStatus::Completed => cell.fg(Color::Green),
        WorkflowStatus::Failed => cell.fg(Color::Red),
        WorkflowStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

fn format_step_status(status: StepStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        StepStatus::Pending => cell.fg(Color::Yellow),
        StepStatus::Running => cell.fg(Color::Blue),
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Skipped => cell.fg(Color::DarkGrey),
    }
}
