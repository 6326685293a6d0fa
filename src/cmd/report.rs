//! Worker self-reports and recovery: `foreman report`, `foreman revive`,
//! `foreman worker`.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use foreman::config::Config;
use foreman::errors::TaskError;
use foreman::liveness::LivenessMonitor;
use foreman::session::TmuxRunner;
use foreman::state::{FailureOutcome, TaskStatus};

use super::super::{ReportCommands, WorkerCommands};

pub async fn cmd_report(config: &Config, command: ReportCommands) -> Result<()> {
    let store = config.store();
    let policy = config.task_policy();
    let now = Utc::now();

    match command {
        ReportCommands::Start { task } => {
            store
                .update(|state| state.start_task(&task, now))
                .await?;
            println!("{} in progress", task);
        }
        ReportCommands::Verify { task } => {
            store
                .update(|state| state.verify_task(&task, now))
                .await?;
            println!("{} verifying", task);
        }
        ReportCommands::Complete { task, files } => {
            let files: Vec<String> = files
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            let status = store
                .update(|state| state.complete_task(&task, files, &policy, now))
                .await?;
            match status {
                TaskStatus::Merged => println!("{} merged", task),
                _ => println!("{} completed; waiting for review", task),
            }
        }
        ReportCommands::Fail { task, reason } => {
            let outcome = store
                .update(|state| state.fail_task(&task, &reason, &policy, now))
                .await?;
            match outcome {
                FailureOutcome::Requeued { retry_count } => println!(
                    "{} failed ({}/{}); back in the queue",
                    task, retry_count, policy.max_retries
                ),
                FailureOutcome::Stuck { retry_count } => println!(
                    "{} failed {} times and is now stuck: {}",
                    task, retry_count, reason
                ),
            }
        }
    }
    Ok(())
}

pub async fn cmd_revive(config: &Config, task: &str) -> Result<()> {
    config
        .store()
        .update(|state| -> Result<(), TaskError> { state.revive_task(task, Utc::now()) })
        .await?;
    println!("{} revived and queued", task);
    Ok(())
}

pub async fn cmd_worker(config: &Config, command: WorkerCommands) -> Result<()> {
    match command {
        WorkerCommands::Restart { id } => {
            let monitor = LivenessMonitor::new(
                config.store(),
                Arc::new(TmuxRunner::from_config(config)),
                config.worker_timeout(),
            );
            if monitor.restart_worker(&id).await? {
                println!("{} restarted", id);
            } else {
                anyhow::bail!(
                    "Could not restart {}; see the activity log for the session error",
                    id
                );
            }
        }
    }
    Ok(())
}
