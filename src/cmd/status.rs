//! Read-only views: `foreman status`, `foreman stuck`.

use anyhow::Result;

use foreman::config::Config;
use foreman::server::StuckReport;
use foreman::state::{PipelineState, Stage, WorkerStatus};

fn ago(state: &PipelineState, at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match at {
        Some(at) => {
            let secs = (state.last_updated - at).num_seconds().max(0);
            format!("{}s before last update", secs)
        }
        None => "never".to_string(),
    }
}

pub async fn cmd_status(config: &Config) -> Result<()> {
    let Some(state) = config.store().read().await? else {
        println!();
        println!("No pipeline state. Run 'foreman init' to ingest specs.");
        println!();
        return Ok(());
    };

    println!();
    println!("Foreman Pipeline Status");
    println!("=======================");
    println!();
    println!("Project:      {}", state.project);
    println!("Run:          {:?}", state.status);
    println!(
        "Orchestrator: {:?} ({} polls, last {})",
        state.orchestrator.status,
        state.orchestrator.total_polls,
        ago(&state, state.orchestrator.last_poll)
    );
    println!();

    let s = &state.stats;
    println!(
        "Tasks: {}/{} merged, {} skipped, {} stuck, {} need a human, {} failure reports",
        s.completed_tasks,
        s.total_tasks,
        s.skipped_tasks,
        s.stuck_tasks,
        s.needs_human_tasks,
        s.failed_tasks
    );
    println!("Specs: {}/{} complete", s.completed_specs, s.total_specs);
    println!();

    println!("{:<10} Queue", "Stage");
    println!("{:<10} -----", "----------");
    for stage in Stage::ALL {
        let queue = state.queues.get(&stage).cloned().unwrap_or_default();
        let shown = if queue.is_empty() {
            console::style("(empty)".to_string()).dim().to_string()
        } else {
            queue.join(", ")
        };
        println!("{:<10} {}", stage, shown);
    }
    println!();

    println!("{:<16} {:<10} {:<14} Task", "Worker", "Stage", "Status");
    println!(
        "{:<16} {:<10} {:<14} ----",
        "----------------", "----------", "--------------"
    );
    for worker in state.workers.values() {
        let status = match worker.status {
            WorkerStatus::Idle => console::style(worker.status.to_string()).dim(),
            WorkerStatus::Working | WorkerStatus::Verifying => {
                console::style(worker.status.to_string()).green()
            }
            WorkerStatus::Stuck | WorkerStatus::Offline => {
                console::style(worker.status.to_string()).red()
            }
        };
        println!(
            "{:<16} {:<10} {:<14} {}",
            worker.id,
            worker.stage,
            status,
            worker.current_task.as_deref().unwrap_or("-")
        );
    }
    println!();

    println!("{:<20} {:<10} Progress (complete/total per stage)", "Spec", "Status");
    for spec in state.specs.values() {
        let progress = Stage::ALL
            .iter()
            .filter_map(|stage| {
                let p = spec.progress.get(stage)?;
                (p.total > 0).then(|| format!("{} {}/{}", stage, p.complete, p.total))
            })
            .collect::<Vec<_>>()
            .join("  ");
        println!(
            "{:<20} {:<10} {}",
            spec.id,
            format!("{:?}", spec.status),
            progress
        );
    }
    println!();

    if let Some(last) = state.activity.last() {
        println!("Last activity: {} ({})", last.message, last.timestamp.to_rfc3339());
        println!();
    }
    Ok(())
}

pub async fn cmd_stuck(config: &Config) -> Result<()> {
    let state = config.store().load().await?;
    let report = StuckReport::from_state(&state);

    println!();
    println!(
        "{} ({})",
        console::style("Stuck: retries exhausted").red().bold(),
        report.stuck.len()
    );
    if report.stuck.is_empty() {
        println!("  none");
    }
    for task in &report.stuck {
        println!("  {:<12} {}", task.id, task.title);
        println!(
            "  {:<12} reason: {} (after {} attempts)",
            "",
            task.stuck_reason.as_deref().unwrap_or("unknown"),
            task.retry_count
        );
        if let Some(note) = &task.oracle_guidance {
            if !note.guidance.is_empty() {
                println!("  {:<12} oracle: {}", "", note.guidance);
            }
            if note.escalate {
                println!("  {:<12} oracle: {}", "", console::style("a human should look").yellow());
            }
            if let Some(path) = &note.path {
                println!("  {:<12} details: {}", "", path);
            }
        }
    }
    if !report.stuck.is_empty() {
        println!("  Revive with `foreman revive <task>` once the cause is fixed.");
    }
    println!();

    println!(
        "{} ({})",
        console::style("Needs human: a decision only a person can make")
            .yellow()
            .bold(),
        report.needs_human.len()
    );
    if report.needs_human.is_empty() {
        println!("  none");
    }
    for task in &report.needs_human {
        println!("  {:<12} {}", task.id, task.title);
        if let Some(needed) = &task.human_needed {
            println!("  {:<12} needed: {}", "", needed);
        }
        for option in &task.human_options {
            println!("  {:<12} option: {}", "", option);
        }
    }
    if !report.needs_human.is_empty() {
        println!(
            "  Details are written to {}",
            config.issues_dir.display()
        );
    }
    println!();

    if !report.interventions.is_empty() {
        println!("{}", console::style("Strategist interventions").bold());
        for i in &report.interventions {
            println!(
                "  {} {:<12} {:<18} {}",
                i.timestamp.format("%Y-%m-%d %H:%M"),
                i.task_id,
                i.decision,
                i.reasoning
            );
        }
        println!();
    }
    Ok(())
}
