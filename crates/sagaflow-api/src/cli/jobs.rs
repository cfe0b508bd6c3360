//! CLI job listing.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};

use sagaflow_types::job::{JobFilter, JobRecord, JobState};

use super::JobStateArg;
use crate::state::AppState;

pub async fn list(
    state: &AppState,
    queue: Option<String>,
    job_state: Option<JobStateArg>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let filter = JobFilter {
        queue,
        state: job_state.map(JobState::from),
        limit,
    };
    let jobs = state
        .engine
        .queue()
        .list_jobs(&filter)
        .await
        .context("Failed to list jobs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Queue"),
            Cell::new("Step"),
            Cell::new("State"),
            Cell::new("Attempt"),
            Cell::new("Scheduled"),
            Cell::new("Last error"),
        ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.queue),
            Cell::new(step_label(job)),
            format_state(job.state),
            Cell::new(format!("{}/{}", job.attempt, job.max_attempts)),
            Cell::new(job.scheduled_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(job.last_error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

/// `workflow_type/step` from the payload, or `?` when it does not decode.
fn step_label(job: &JobRecord) -> String {
    job.step_job()
        .map(|s| format!("{}/{}", s.workflow_type, s.step_name))
        .unwrap_or_else(|_| "?".to_string())
}

fn format_state(state: JobState) -> Cell {
    let cell = Cell::new(state.as_str());
    match state {
        JobState::Available => cell.fg(Color::Yellow),
        JobState::Running => cell.fg(Color::Blue),
        JobState::Retryable => cell.fg(Color::Magenta),
        JobState::Completed => cell.fg(Color::Green),
        JobState::Discarded => cell.fg(Color::Red),
    }
}
