//! Plan ingestion command: `foreman init`.

use anyhow::Result;
use chrono::Utc;

use foreman::config::Config;
use foreman::errors::StoreError;
use foreman::plan::{self, ClaudeReconciler};
use foreman::review::ClaudeCli;
use foreman::state::{PipelineState, Stage};

pub async fn cmd_init(config: &Config, force: bool, dry_run: bool, reconcile: bool) -> Result<()> {
    let plan = plan::ingest(
        &config.project_dir,
        &config.specs_dir,
        &config.toml.sessions.prefix,
    )?;

    println!();
    println!(
        "Plan for {}: {} specs, {} tasks, {} workers",
        console::style(&config.project_name).bold(),
        plan.specs.len(),
        plan.tasks.len(),
        plan.workers.len()
    );
    println!();
    for spec in &plan.specs {
        println!("{} ({})", console::style(&spec.name).bold(), spec.id);
        for stage in Stage::ALL {
            for task in plan
                .tasks_for_stage(stage)
                .filter(|t| t.spec_id == spec.id)
            {
                let deps = if task.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" ← {}", task.depends_on.join(", "))
                };
                println!(
                    "  {:<10} {:<12} {}{}",
                    stage,
                    task.id,
                    task.title,
                    console::style(deps).dim()
                );
            }
        }
        println!();
    }

    let mut state = plan.into_state(
        config.project_name.clone(),
        config.toml.orchestrator.poll_interval_secs,
        Utc::now(),
    );
    if reconcile {
        reconcile_with_project(config, &mut state).await;
    }

    if dry_run {
        println!("Dry run: no state written.");
        return Ok(());
    }

    for warning in config.validate() {
        println!("{} {}", console::style("warning:").yellow(), warning);
    }
    config.ensure_directories()?;

    match config.store().initialize(state, force).await {
        Ok(state) => {
            let queued: usize = state.queues.values().map(Vec::len).sum();
            println!(
                "Initialized {} with {} tasks ready to assign.",
                config.state_file.display(),
                queued
            );
            println!();
            println!("Next steps:");
            println!("  1. Run `foreman run` to start the poll loop");
            println!("  2. Run `foreman status` to watch progress");
            Ok(())
        }
        Err(StoreError::AlreadyInitialized { path }) => {
            anyhow::bail!(
                "State already exists at {}. Use `foreman init --force` to replace it.",
                path.display()
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// Mark tasks the project already implements. A collaborator failure leaves
/// the plan as ingested.
async fn reconcile_with_project(config: &Config, state: &mut PipelineState) {
    println!("Reconciling plan with the existing project...");
    let cli = ClaudeCli::new(config.claude_cmd())
        .with_working_dir(&config.project_dir)
        .with_timeout(config.review_timeout());
    let reconciler = ClaudeReconciler::new(cli);
    match plan::reconcile(state, &reconciler, &config.project_dir, &config.specs_dir).await {
        Ok(report) => {
            for id in &report.marked {
                let evidence = state
                    .tasks
                    .get(id)
                    .and_then(|t| t.reconciled.as_deref())
                    .unwrap_or_default();
                println!(
                    "  {} {:<12} {}",
                    console::style("✓").green(),
                    id,
                    console::style(evidence).dim()
                );
            }
            for id in &report.blocked {
                println!(
                    "  {} {:<12} implemented, but waits on unfinished dependencies",
                    console::style("·").yellow(),
                    id
                );
            }
            println!(
                "{} tasks already implemented, {} remaining.",
                report.marked.len(),
                state.tasks.len() - report.marked.len()
            );
            println!();
        }
        Err(e) => {
            println!(
                "{} reconciliation skipped: {}",
                console::style("warning:").yellow(),
                e
            );
            println!();
        }
    }
}
