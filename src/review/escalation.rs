//! The review/escalation state machine.
//!
//! ```text
//! completed --review--> approved --merge--> merged
//!     |                    \--conflict--> rejected
//!     \--> rejected (attempt < max) --> in_progress (worker fixes, completes again)
//!     \--> rejected (attempt == max) --> escalated --strategist--> one of:
//!              DIFFERENT_APPROACH -> in_progress, attempts reset
//!              SKIP_TASK          -> skipped (unlocks successors)
//!              MODIFY_SPEC        -> needs_human
//!              NEED_HUMAN         -> needs_human
//! ```
//!
//! Collaborator calls happen outside the store lock. Their results are applied
//! in one update that re-checks the task's status, so a transport failure or a
//! concurrent change leaves the task exactly where it was for the next pass.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::context::{ReviewContext, StrategistContext};
use super::response::ReviewResponse;
use super::{Reviewer, Strategist};
use crate::errors::{CollaboratorError, TaskError, is_fatal};
use crate::session::{SessionRunner, messages};
use crate::state::{
    Activity, ActivityKind, EscalationDecision, PipelineState, RejectionOutcome, Resolution,
    StateStore, Task, TaskPolicy, TaskStatus,
};
use crate::tracker::{GitIntegration, MergeOutcome};

/// Filesystem locations and switches for the machine.
#[derive(Debug, Clone)]
pub struct EscalationSettings {
    pub project_dir: PathBuf,
    pub specs_dir: PathBuf,
    pub issues_dir: PathBuf,
    pub auto_push: bool,
}

/// What one pass over completed and escalated tasks did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReviewPassReport {
    pub merged: Vec<String>,
    pub rejected: Vec<String>,
    pub escalated: Vec<String>,
    pub decisions: Vec<(String, EscalationDecision)>,
    /// Left untouched after a collaborator failure
    pub deferred: Vec<String>,
    /// Branch landed on main but the task had already moved to another status
    pub unrecorded: Vec<String>,
}

/// Written to the issues directory when a human has to act.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRecord<'a> {
    task_id: &'a str,
    spec_id: &'a str,
    title: &'a str,
    stage: String,
    decision: EscalationDecision,
    reasoning: &'a str,
    what_is_needed: Option<&'a str>,
    options: &'a [String],
    review_issues: &'a [String],
    created_at: DateTime<Utc>,
}

fn holder_session(state: &PipelineState, task_id: &str) -> Option<String> {
    let worker = state.tasks.get(task_id)?.assigned_to.as_deref()?;
    state.workers.get(worker).map(|w| w.session.clone())
}

pub struct EscalationMachine {
    store: StateStore,
    reviewer: Arc<dyn Reviewer>,
    strategist: Arc<dyn Strategist>,
    git: Arc<dyn GitIntegration>,
    sessions: Arc<dyn SessionRunner>,
    policy: TaskPolicy,
    settings: EscalationSettings,
}

impl EscalationMachine {
    pub fn new(
        store: StateStore,
        reviewer: Arc<dyn Reviewer>,
        strategist: Arc<dyn Strategist>,
        git: Arc<dyn GitIntegration>,
        sessions: Arc<dyn SessionRunner>,
        policy: TaskPolicy,
        settings: EscalationSettings,
    ) -> Self {
        Self {
            store,
            reviewer,
            strategist,
            git,
            sessions,
            policy,
            settings,
        }
    }

    /// Review every completed task, then resolve every escalated one.
    pub async fn run_pass(&self) -> Result<ReviewPassReport> {
        let mut report = ReviewPassReport::default();

        let completed = self.task_ids(TaskStatus::Completed).await?;
        for task_id in completed {
            if let Err(e) = self.review_task(&task_id, &mut report).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                warn!(task = %task_id, error = %e, "review step failed");
            }
        }

        // Reload: the reviews above may have escalated tasks.
        let escalated = self.task_ids(TaskStatus::Escalated).await?;
        for task_id in escalated {
            if let Err(e) = self.resolve_task(&task_id, &mut report).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                warn!(task = %task_id, error = %e, "escalation step failed");
            }
        }
        Ok(report)
    }

    async fn task_ids(&self, status: TaskStatus) -> Result<Vec<String>> {
        Ok(self
            .store
            .read()
            .await?
            .map(|state| {
                state
                    .tasks_with_status(status)
                    .map(|t| t.id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn notify(&self, session: Option<String>, task_id: &str, message: String) {
        let Some(session) = session else {
            debug!(task = %task_id, "no session to notify");
            return;
        };
        if let Err(e) = self.sessions.send(&session, &message).await {
            warn!(task = %task_id, session = %session, error = %e, "could not deliver feedback");
        }
    }

    // ===== review =====

    async fn review_task(&self, task_id: &str, report: &mut ReviewPassReport) -> Result<()> {
        let state = self.store.load().await?;
        let ctx = ReviewContext::new(&state, task_id, self.policy.max_review_attempts)?;
        let task = &ctx.task;
        if task.status != TaskStatus::Completed {
            return Ok(());
        }

        let Some(branch) = task.branch.clone() else {
            warn!(task = %task_id, "completed task has no branch; merging record only");
            self.store
                .update(|state| state.record_merge(task_id, Utc::now()))
                .await?;
            report.merged.push(task_id.to_string());
            return Ok(());
        };

        let diff = match self.git.diff(&branch).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(task = %task_id, branch = %branch, error = %e, "could not diff branch");
                report.deferred.push(task_id.to_string());
                return Ok(());
            }
        };

        let verdict = match self.reviewer.review(&ctx, &diff).await {
            Ok(verdict) => verdict,
            Err(e) if e.is_retryable() => {
                warn!(task = %task_id, error = %e, "review deferred");
                report.deferred.push(task_id.to_string());
                return Ok(());
            }
            Err(CollaboratorError::Parse { message, .. }) => {
                warn!(task = %task_id, error = %message, "review response unparseable; rejecting");
                ReviewResponse::reject(vec![format!(
                    "Review response could not be parsed: {}",
                    message
                )])
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "review failed; rejecting");
                ReviewResponse::reject(vec![format!("Review could not be completed: {}", e)])
            }
        };

        if !verdict.suggestions.is_empty() {
            debug!(task = %task_id, suggestions = ?verdict.suggestions, "review suggestions");
        }

        if verdict.approved {
            self.merge_task(task, &branch, report).await
        } else {
            self.reject_task(task, &verdict.issues, report).await
        }
    }

    async fn merge_task(
        &self,
        task: &Task,
        branch: &str,
        report: &mut ReviewPassReport,
    ) -> Result<()> {
        let message = format!("Merge {}: {}", task.id, task.title);
        match self.git.merge(branch, &message).await {
            Ok(MergeOutcome::Merged { .. }) | Ok(MergeOutcome::UpToDate) => {}
            Ok(MergeOutcome::Conflict { paths }) => {
                warn!(task = %task.id, ?paths, "merge conflict");
                let issue = format!("Merge conflict with main in: {}", paths.join(", "));
                return self.reject_task(task, &[issue], report).await;
            }
            Err(e) => {
                warn!(task = %task.id, branch, error = %e, "merge failed; will retry");
                report.deferred.push(task.id.clone());
                return Ok(());
            }
        }

        // main already has the branch from here on.
        let moved_to = self
            .store
            .update(|state| -> Result<_, TaskError> {
                let now = Utc::now();
                match state.record_merge(&task.id, now) {
                    Ok(()) => Ok(None),
                    Err(TaskError::InvalidTransition { status, .. }) => {
                        if status != TaskStatus::Merged {
                            state.log(
                                Activity::new(
                                    now,
                                    ActivityKind::System,
                                    format!(
                                        "Branch {} was merged into main but {} is {}; merge not recorded",
                                        branch, task.id, status
                                    ),
                                )
                                .with_task(&task.id)
                                .with_spec(&task.spec_id),
                            );
                        }
                        Ok(Some(status))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        match moved_to {
            None => {
                info!(task = %task.id, spec = %task.spec_id, "task merged");
                report.merged.push(task.id.clone());
            }
            Some(TaskStatus::Merged) => {
                debug!(task = %task.id, branch, "merge already recorded");
                return Ok(());
            }
            Some(status) => {
                error!(
                    task = %task.id,
                    branch,
                    %status,
                    "branch merged into main but the task changed status during review; merge not recorded"
                );
                report.unrecorded.push(task.id.clone());
                return Ok(());
            }
        }

        if self.settings.auto_push
            && let Err(e) = self.git.push_main().await
        {
            warn!(error = %e, "push after merge failed");
        }
        Ok(())
    }

    async fn reject_task(
        &self,
        task: &Task,
        issues: &[String],
        report: &mut ReviewPassReport,
    ) -> Result<()> {
        let policy = &self.policy;
        let (outcome, session) = self
            .store
            .update(|state| -> Result<_, TaskError> {
                let outcome = state.record_rejection(&task.id, issues, policy, Utc::now())?;
                Ok((outcome, holder_session(state, &task.id)))
            })
            .await?;

        match outcome {
            RejectionOutcome::Retry { attempts } => {
                info!(task = %task.id, attempts, "review rejected");
                report.rejected.push(task.id.clone());
                let message = messages::review_feedback_message(
                    task,
                    issues,
                    attempts,
                    policy.max_review_attempts,
                );
                self.notify(session, &task.id, message).await;
            }
            RejectionOutcome::Escalated { attempts } => {
                warn!(task = %task.id, attempts, "review attempts exhausted; escalating");
                report.escalated.push(task.id.clone());
            }
        }
        Ok(())
    }

    // ===== escalation =====

    async fn resolve_task(&self, task_id: &str, report: &mut ReviewPassReport) -> Result<()> {
        let state = self.store.load().await?;
        let ctx = StrategistContext::gather(
            &state,
            task_id,
            &self.settings.project_dir,
            &self.settings.specs_dir,
            self.policy.max_review_attempts,
        )?;
        if ctx.task.status != TaskStatus::Escalated {
            return Ok(());
        }

        let resolution = match self.strategist.decide(&ctx).await {
            Ok(resolution) => resolution,
            Err(e) if e.is_retryable() => {
                warn!(task = %task_id, error = %e, "strategist deferred");
                report.deferred.push(task_id.to_string());
                return Ok(());
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "strategist gave no decision; needs a human");
                let reasoning = match e {
                    CollaboratorError::Parse { message, .. } => {
                        format!("Strategist response could not be parsed: {}", message)
                    }
                    other => format!("Strategist could not decide: {}", other),
                };
                let mut resolution = Resolution::new(EscalationDecision::NeedHuman, reasoning);
                resolution.human_needed =
                    Some("Review the escalated task manually and decide how to proceed".into());
                resolution
            }
        };

        let (status, session, task) = self
            .store
            .update(|state| -> Result<_, TaskError> {
                let status = state.apply_resolution(task_id, &resolution, Utc::now())?;
                let task = state.task(task_id)?.clone();
                Ok((status, holder_session(state, task_id), task))
            })
            .await?;
        info!(task = %task_id, decision = %resolution.decision, %status, "escalation resolved");
        report
            .decisions
            .push((task_id.to_string(), resolution.decision));

        match resolution.decision {
            EscalationDecision::DifferentApproach => {
                let guidance = task
                    .strategist_guidance
                    .clone()
                    .unwrap_or_else(|| resolution.reasoning.clone());
                self.notify(session, task_id, messages::guidance_message(&task, &guidance))
                    .await;
            }
            EscalationDecision::SkipTask => {}
            EscalationDecision::ModifySpec | EscalationDecision::NeedHuman => {
                match self.write_issue(&task, &resolution) {
                    Ok(path) => info!(task = %task_id, path = %path.display(), "issue recorded"),
                    Err(e) => warn!(task = %task_id, error = %e, "could not write issue file"),
                }
            }
        }
        Ok(())
    }

    fn write_issue(&self, task: &Task, resolution: &Resolution) -> Result<PathBuf> {
        let now = Utc::now();
        let record = IssueRecord {
            task_id: &task.id,
            spec_id: &task.spec_id,
            title: &task.title,
            stage: task.stage.to_string(),
            decision: resolution.decision,
            reasoning: &resolution.reasoning,
            what_is_needed: task.human_needed.as_deref(),
            options: &resolution.human_options,
            review_issues: &task.review_issues,
            created_at: now,
        };
        std::fs::create_dir_all(&self.settings.issues_dir).with_context(|| {
            format!(
                "Failed to create issues directory {}",
                self.settings.issues_dir.display()
            )
        })?;
        let path = self.settings.issues_dir.join(format!(
            "{}-{}.json",
            task.id,
            now.format("%Y%m%dT%H%M%SZ")
        ));
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
