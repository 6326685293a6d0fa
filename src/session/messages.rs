//! Text typed into worker sessions.
//!
//! Every message is a single line: a newline would submit a partial prompt.

use chrono::Duration;

use crate::state::{OracleNote, Task, Worker};

fn one_line(parts: &[String]) -> String {
    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.replace('\n', " "))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Instructions for how a worker reports back.
fn report_hint(task_id: &str) -> String {
    format!(
        "Report with: foreman report start {id}, foreman report verify {id}, \
         foreman report complete {id} --files <paths>, foreman report fail {id} --reason <why>",
        id = task_id
    )
}

/// First message in a fresh session.
pub fn bootstrap_message(worker: &Worker) -> String {
    one_line(&[
        format!(
            "[foreman] You are {} working the {} stage.",
            worker.id, worker.stage
        ),
        "Wait for task assignments; work one task at a time on the branch you are given."
            .to_string(),
    ])
}

pub fn assignment_message(task: &Task) -> String {
    let mut parts = vec![
        format!(
            "[foreman] New {} task {} for spec {}: {}",
            task.stage, task.id, task.spec_id, task.title
        ),
        task.description.clone(),
    ];
    if let Some(branch) = &task.branch {
        parts.push(format!("Commit to branch {}", branch));
    }
    if let Some(reason) = &task.failure_reason {
        parts.push(format!(
            "Previous attempt {} failed: {}",
            task.retry_count, reason
        ));
    }
    if let Some(guidance) = &task.strategist_guidance {
        parts.push(format!("Guidance: {}", guidance));
    }
    if let Some(note) = &task.oracle_guidance
        && !note.guidance.is_empty()
    {
        parts.push(format!("Oracle guidance from the last stuck attempt: {}", note.guidance));
    }
    if !task.review_issues.is_empty() {
        parts.push(format!(
            "Open review issues: {}",
            task.review_issues.join("; ")
        ));
    }
    parts.push(report_hint(&task.id));
    one_line(&parts)
}

pub fn review_feedback_message(task: &Task, issues: &[String], attempt: u32, max: u32) -> String {
    one_line(&[
        format!(
            "[foreman] Review of {} rejected (attempt {}/{}).",
            task.id, attempt, max
        ),
        format!("Fix: {}", issues.join("; ")),
        report_hint(&task.id),
    ])
}

pub fn guidance_message(task: &Task, guidance: &str) -> String {
    one_line(&[
        format!(
            "[foreman] Task {} needs a different approach after repeated rejected reviews.",
            task.id
        ),
        format!("Guidance: {}", guidance),
        report_hint(&task.id),
    ])
}

/// Sent to the worker that got stuck. The task stays stuck until revived.
pub fn oracle_guidance_message(task: &Task, note: &OracleNote) -> String {
    let mut parts = vec![
        format!("[foreman] Oracle guidance for stuck task {}.", task.id),
        format!("Analysis: {}", note.analysis),
        format!("Suggested fix: {}", note.guidance),
    ];
    if let Some(path) = &note.path {
        parts.push(format!("Full guidance in {}", path));
    }
    parts.push(
        "The task stays stuck until an operator runs foreman revive; wait for your next assignment."
            .to_string(),
    );
    one_line(&parts)
}

pub fn nudge_message(worker: &Worker, idle_for: Duration) -> String {
    one_line(&[
        format!(
            "[foreman] Status check for {}: no activity for {} minutes on {}.",
            worker.id,
            idle_for.num_minutes(),
            worker.current_task.as_deref().unwrap_or("your task")
        ),
        "If you are stuck, report failure with a reason; otherwise report progress.".to_string(),
    ])
}
