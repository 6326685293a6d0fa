//! Task and worker transitions.
//!
//! Each method here is a pure mutation of [`PipelineState`] meant to run inside
//! a single [`StateStore::update`](super::StateStore::update) call. A method
//! that returns an error has not mutated anything, so the store discards the
//! document and nothing is persisted.
//!
//! ```text
//! pending ─assign─▶ assigned ─start─▶ in_progress ─verify─▶ verifying
//!    ▲                  │                  │                    │
//!    └──── fail (retry) ┴──────────────────┴──── complete ──────┘
//!                                                     │
//!                               completed ◀───────────┘
//!                                   │ review
//!            ┌──────────────────────┼─────────────────────┐
//!         merged           in_progress (retry)        escalated
//!                                                         │ strategist
//!                         in_progress / skipped / needs_human
//! ```

use chrono::{DateTime, Utc};

use super::model::{
    Activity, ActivityKind, EscalationDecision, Intervention, OracleNote, OrchestratorStatus,
    PipelineState, RunStatus, TaskStatus, WorkerStatus,
};
use super::queue;
use crate::errors::TaskError;

/// Limits applied by lifecycle transitions.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    /// Failures before a task becomes stuck
    pub max_retries: u32,
    /// Rejections before a task is escalated
    pub max_review_attempts: u32,
    /// When false, a completion report merges immediately
    pub review_enabled: bool,
    pub branch_prefix: String,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_review_attempts: 3,
            review_enabled: true,
            branch_prefix: "foreman/".to_string(),
        }
    }
}

/// Result of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { retry_count: u32 },
    Stuck { retry_count: u32 },
}

/// Result of recording a review rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// Sent back to the worker
    Retry { attempts: u32 },
    /// Attempts exhausted; a strategist decision is now required
    Escalated { attempts: u32 },
}

/// Side-effect payload of a strategist decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub decision: EscalationDecision,
    pub reasoning: String,
    pub guidance: Option<String>,
    pub backlog_note: Option<String>,
    pub human_needed: Option<String>,
    pub human_options: Vec<String>,
}

impl Resolution {
    pub fn new(decision: EscalationDecision, reasoning: impl Into<String>) -> Self {
        Self {
            decision,
            reasoning: reasoning.into(),
            guidance: None,
            backlog_note: None,
            human_needed: None,
            human_options: Vec::new(),
        }
    }
}

impl PipelineState {
    fn expect_status(
        &self,
        task_id: &str,
        allowed: &[TaskStatus],
        action: &'static str,
    ) -> Result<(), TaskError> {
        let task = self.task(task_id)?;
        if allowed.contains(&task.status) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task: task_id.to_string(),
                status: task.status,
                action,
            })
        }
    }

    fn check_dependencies(&self, task_id: &str) -> Result<(), TaskError> {
        let unmet = queue::unmet_dependencies(self.task(task_id)?, self);
        if unmet.is_empty() {
            Ok(())
        } else {
            Err(TaskError::DependencyViolation {
                task: task_id.to_string(),
                unmet,
            })
        }
    }

    /// Release whichever worker holds `task_id`, if any. Returns its id.
    fn release_holder(&mut self, task_id: &str, now: DateTime<Utc>) -> Option<String> {
        let worker = self
            .workers
            .values_mut()
            .find(|w| w.current_task.as_deref() == Some(task_id))?;
        worker.release(now);
        Some(worker.id.clone())
    }

    /// Put reworked task back in the hands of its worker, or back in the queue
    /// when that worker has moved on.
    fn return_to_worker(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), TaskError> {
        let task = self.task(task_id)?.clone();
        if let Some(worker) = self
            .workers
            .values_mut()
            .find(|w| w.current_task.as_deref() == Some(task_id))
        {
            worker.bind(&task, WorkerStatus::Working, now);
            return Ok(());
        }
        if let Some(id) = &task.assigned_to
            && let Some(worker) = self.workers.get_mut(id)
            && worker.status == WorkerStatus::Idle
        {
            worker.bind(&task, WorkerStatus::Working, now);
            return Ok(());
        }
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.assigned_at = None;
        queue::refresh_queues(self);
        Ok(())
    }

    /// Hand a pending, ready task to an idle worker of the same stage.
    pub fn assign_task(
        &mut self,
        task_id: &str,
        worker_id: &str,
        policy: &TaskPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.expect_status(task_id, &[TaskStatus::Pending], "assign")?;
        let worker = self.worker(worker_id)?;
        if worker.status != WorkerStatus::Idle {
            return Err(TaskError::WorkerUnavailable {
                worker: worker_id.to_string(),
                status: worker.status,
            });
        }
        let task = self.task(task_id)?;
        if task.stage != worker.stage {
            return Err(TaskError::StageMismatch {
                task: task_id.to_string(),
                task_stage: task.stage.to_string(),
                worker: worker_id.to_string(),
                worker_stage: worker.stage.to_string(),
            });
        }
        self.check_dependencies(task_id)?;

        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(worker_id.to_string());
        task.assigned_at = Some(now);
        task.started_at = None;
        if task.branch.is_none() {
            task.branch = Some(format!("{}{}", policy.branch_prefix, task.id));
        }
        let task = task.clone();

        self.worker_mut(worker_id)?
            .bind(&task, WorkerStatus::Working, now);
        queue::remove_from_queues(self, task_id);
        self.log(
            Activity::new(now, ActivityKind::TaskAssigned, format!("Assigned: {}", task.title))
                .with_task(task_id)
                .with_worker(worker_id)
                .with_spec(&task.spec_id),
        );
        Ok(())
    }

    /// Worker acknowledged the task and began work.
    pub fn start_task(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_status(task_id, &[TaskStatus::Assigned], "start")?;
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        let worker_id = task.assigned_to.clone();
        if let Some(id) = &worker_id
            && let Some(worker) = self.workers.get_mut(id)
        {
            worker.last_activity = now;
            worker.nudged_at = None;
        }
        let mut entry = Activity::new(now, ActivityKind::TaskStarted, "Task started").with_task(task_id);
        if let Some(id) = worker_id {
            entry = entry.with_worker(id);
        }
        self.log(entry);
        Ok(())
    }

    /// Worker is running its own checks before reporting completion.
    pub fn verify_task(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_status(
            task_id,
            &[TaskStatus::Assigned, TaskStatus::InProgress],
            "verify",
        )?;
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Verifying;
        let worker_id = task.assigned_to.clone();
        if let Some(id) = &worker_id
            && let Some(worker) = self.workers.get_mut(id)
        {
            worker.status = WorkerStatus::Verifying;
            worker.last_activity = now;
            worker.nudged_at = None;
        }
        self.log(
            Activity::new(now, ActivityKind::TaskVerifying, "Task verifying").with_task(task_id),
        );
        Ok(())
    }

    /// Worker reports the task done.
    ///
    /// With review enabled the task waits in `completed` and the worker stays
    /// bound to it; otherwise it is merged on the spot and successors unlock.
    pub fn complete_task(
        &mut self,
        task_id: &str,
        files_changed: Vec<String>,
        policy: &TaskPolicy,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, TaskError> {
        self.expect_status(
            task_id,
            &[
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Verifying,
            ],
            "complete",
        )?;
        self.check_dependencies(task_id)?;

        let task = self.task_mut(task_id)?;
        task.completed_at = Some(now);
        if !files_changed.is_empty() {
            task.files_changed = files_changed;
        }
        task.status = if policy.review_enabled {
            TaskStatus::Completed
        } else {
            task.merged_at = Some(now);
            TaskStatus::Merged
        };
        let status = task.status;
        let title = task.title.clone();
        let spec_id = task.spec_id.clone();
        let worker_id = task.assigned_to.clone();

        if let Some(id) = &worker_id
            && let Some(worker) = self.workers.get_mut(id)
        {
            if policy.review_enabled {
                worker.status = WorkerStatus::Verifying;
                worker.last_activity = now;
            } else {
                worker.tasks_completed += 1;
                worker.release(now);
            }
        }

        let mut entry = Activity::new(now, ActivityKind::TaskCompleted, format!("Completed: {}", title))
            .with_task(task_id)
            .with_spec(spec_id);
        if let Some(id) = worker_id {
            entry = entry.with_worker(id);
        }
        self.log(entry);

        if status == TaskStatus::Merged {
            queue::refresh_queues(self);
        }
        self.refresh_derived(now);
        Ok(status)
    }

    /// Failure accounting: requeue below the retry limit, otherwise mark stuck.
    pub fn fail_task(
        &mut self,
        task_id: &str,
        reason: &str,
        policy: &TaskPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TaskError> {
        self.expect_status(
            task_id,
            &[
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Verifying,
            ],
            "fail",
        )?;

        let task = self.task_mut(task_id)?;
        task.retry_count += 1;
        let retry_count = task.retry_count;
        let worker_id = task.assigned_to.take();
        let outcome = if retry_count >= policy.max_retries {
            task.status = TaskStatus::Stuck;
            task.stuck_reason = Some(reason.to_string());
            task.oracle_guidance = None;
            FailureOutcome::Stuck { retry_count }
        } else {
            task.status = TaskStatus::Pending;
            task.failure_reason = Some(reason.to_string());
            task.assigned_at = None;
            task.started_at = None;
            FailureOutcome::Requeued { retry_count }
        };
        self.stats.failed_tasks += 1;

        if let Some(id) = &worker_id
            && let Some(worker) = self.workers.get_mut(id)
            && worker.current_task.as_deref() == Some(task_id)
        {
            worker.tasks_failed += 1;
            match outcome {
                // Held until the oracle has looked at the task.
                FailureOutcome::Stuck { .. } => {
                    worker.status = WorkerStatus::Stuck;
                    worker.nudged_at = None;
                    worker.last_activity = now;
                }
                FailureOutcome::Requeued { .. } => worker.release(now),
            }
        }

        let (kind, message) = match &outcome {
            FailureOutcome::Stuck { .. } => (
                ActivityKind::TaskStuck,
                format!("Stuck after {} failures: {}", retry_count, reason),
            ),
            FailureOutcome::Requeued { .. } => (
                ActivityKind::TaskFailed,
                format!("Failed (attempt {}): {}", retry_count, reason),
            ),
        };
        let mut entry = Activity::new(now, kind, message).with_task(task_id);
        if let Some(id) = worker_id {
            entry = entry.with_worker(id);
        }
        self.log(entry);

        queue::refresh_queues(self);
        self.refresh_derived(now);
        Ok(outcome)
    }

    /// Reset a stuck task so it can be scheduled again.
    pub fn revive_task(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_status(task_id, &[TaskStatus::Stuck], "revive")?;
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.review_attempts = 0;
        task.escalated = false;
        task.stuck_reason = None;
        task.assigned_to = None;
        self.release_stuck_worker(task_id, now);
        self.log(
            Activity::new(now, ActivityKind::TaskRevived, "Stuck task revived").with_task(task_id),
        );
        queue::refresh_queues(self);
        self.refresh_derived(now);
        Ok(())
    }

    /// Free the worker still parked on stuck `task_id`. Returns its id.
    pub fn release_stuck_worker(&mut self, task_id: &str, now: DateTime<Utc>) -> Option<String> {
        let worker = self.workers.values_mut().find(|w| {
            w.status == WorkerStatus::Stuck && w.current_task.as_deref() == Some(task_id)
        })?;
        worker.release(now);
        Some(worker.id.clone())
    }

    /// Attach oracle advice to a stuck task and free the worker that got
    /// stuck on it. The task itself stays stuck until revived. Returns the
    /// released worker id.
    pub fn record_oracle_guidance(
        &mut self,
        task_id: &str,
        note: OracleNote,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, TaskError> {
        self.expect_status(task_id, &[TaskStatus::Stuck], "advise")?;
        let escalate = note.escalate;
        self.task_mut(task_id)?.oracle_guidance = Some(note);
        let released = self.release_stuck_worker(task_id, now);

        let message = if escalate {
            "Oracle guidance recorded; a human is needed"
        } else {
            "Oracle guidance recorded"
        };
        let mut entry = Activity::new(now, ActivityKind::OracleGuidance, message).with_task(task_id);
        if let Some(id) = &released {
            entry = entry.with_worker(id.clone());
        }
        self.log(entry);
        Ok(released)
    }

    /// Record work that already existed before the run as merged.
    pub fn mark_implemented(
        &mut self,
        task_id: &str,
        evidence: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.expect_status(task_id, &[TaskStatus::Pending], "reconcile")?;
        self.check_dependencies(task_id)?;
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Merged;
        task.completed_at = Some(now);
        task.merged_at = Some(now);
        task.reconciled = Some(evidence.to_string());
        let spec_id = task.spec_id.clone();
        queue::remove_from_queues(self, task_id);
        self.log(
            Activity::new(
                now,
                ActivityKind::TaskReconciled,
                format!("Already implemented: {}", evidence),
            )
            .with_task(task_id)
            .with_spec(spec_id),
        );
        queue::refresh_queues(self);
        self.refresh_derived(now);
        Ok(())
    }

    /// Mark a worker whose session died as offline. An active task it held
    /// goes back to `pending` and is re-queued; session loss is not a failure
    /// report, so retry and failure counters are left alone. Returns the
    /// released task id.
    pub fn mark_worker_offline(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, TaskError> {
        let held = self.worker(worker_id)?.current_task.clone();
        let mut released = None;
        if let Some(task_id) = held
            && self.task(&task_id)?.status.is_active()
        {
            let task = self.task_mut(&task_id)?;
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.assigned_at = None;
            task.started_at = None;
            released = Some(task_id);
        }

        let worker = self.worker_mut(worker_id)?;
        worker.release(now);
        worker.status = WorkerStatus::Offline;

        let message = match &released {
            Some(task_id) => format!("Session not running; {} released to the queue", task_id),
            None => "Session not running".to_string(),
        };
        let mut entry =
            Activity::new(now, ActivityKind::WorkerOffline, message).with_worker(worker_id);
        if let Some(task_id) = &released {
            entry = entry.with_task(task_id.clone());
        }
        self.log(entry);

        if released.is_some() {
            queue::refresh_queues(self);
            self.refresh_derived(now);
        }
        Ok(released)
    }

    /// Worker session came back after a restart.
    pub fn mark_worker_restarted(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let worker = self.worker_mut(worker_id)?;
        if worker.current_task.is_none() {
            worker.status = WorkerStatus::Idle;
        }
        worker.last_activity = now;
        worker.nudged_at = None;
        self.log(
            Activity::new(now, ActivityKind::WorkerRestarted, "Session restarted")
                .with_worker(worker_id),
        );
        Ok(())
    }

    /// Stamp one orchestrator poll.
    pub fn record_poll(&mut self, now: DateTime<Utc>) -> u64 {
        let info = &mut self.orchestrator;
        info.last_poll = Some(now);
        info.total_polls += 1;
        let polls = info.total_polls;
        if self.status == RunStatus::Initializing && !self.is_paused() {
            self.status = RunStatus::Running;
        }
        self.log(Activity::new(
            now,
            ActivityKind::OrchestratorPoll,
            format!("Poll #{}", polls),
        ));
        polls
    }

    /// Operator pause/resume/stop. Returns false when nothing changed.
    pub fn set_orchestrator_status(
        &mut self,
        status: OrchestratorStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if self.orchestrator.status == status {
            return false;
        }
        self.orchestrator.status = status;
        if self.status != RunStatus::Complete {
            self.status = match status {
                OrchestratorStatus::Paused => RunStatus::Paused,
                OrchestratorStatus::Active => RunStatus::Running,
                OrchestratorStatus::Stopped => self.status,
            };
        }
        let message = match status {
            OrchestratorStatus::Active => "Orchestrator resumed",
            OrchestratorStatus::Paused => "Orchestrator paused",
            OrchestratorStatus::Stopped => "Orchestrator stop requested",
        };
        self.log(Activity::new(now, ActivityKind::System, message));
        true
    }

    /// Every task has settled; close the run.
    pub fn mark_complete(&mut self, now: DateTime<Utc>) {
        if self.status == RunStatus::Complete {
            return;
        }
        self.status = RunStatus::Complete;
        let s = self.stats;
        self.log(Activity::new(
            now,
            ActivityKind::System,
            format!(
                "Pipeline complete: {} merged, {} skipped, {} stuck, {} need a human",
                s.completed_tasks, s.skipped_tasks, s.stuck_tasks, s.needs_human_tasks
            ),
        ));
    }

    /// Review approved and branch merged.
    pub fn record_merge(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_status(task_id, &[TaskStatus::Completed], "merge")?;
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Merged;
        task.merged_at = Some(now);
        let title = task.title.clone();
        let spec_id = task.spec_id.clone();
        if let Some(worker_id) = self.release_holder(task_id, now)
            && let Some(worker) = self.workers.get_mut(&worker_id)
        {
            worker.tasks_completed += 1;
        }
        self.log(
            Activity::new(now, ActivityKind::TaskMerged, format!("Merged: {}", title))
                .with_task(task_id)
                .with_spec(spec_id),
        );
        queue::refresh_queues(self);
        self.refresh_derived(now);
        Ok(())
    }

    /// Review rejected. Sends the task back or escalates once attempts run out.
    pub fn record_rejection(
        &mut self,
        task_id: &str,
        issues: &[String],
        policy: &TaskPolicy,
        now: DateTime<Utc>,
    ) -> Result<RejectionOutcome, TaskError> {
        self.expect_status(task_id, &[TaskStatus::Completed], "reject")?;
        let task = self.task_mut(task_id)?;
        task.review_attempts += 1;
        task.review_issues.extend(issues.iter().cloned());
        let attempts = task.review_attempts;

        let outcome = if attempts >= policy.max_review_attempts {
            task.status = TaskStatus::Escalated;
            task.escalated = true;
            RejectionOutcome::Escalated { attempts }
        } else {
            task.status = TaskStatus::InProgress;
            RejectionOutcome::Retry { attempts }
        };

        if let RejectionOutcome::Retry { .. } = outcome {
            self.return_to_worker(task_id, now)?;
        }

        let (kind, message) = match outcome {
            RejectionOutcome::Retry { attempts } => (
                ActivityKind::TaskRejected,
                format!(
                    "Review rejected (attempt {}/{}): {}",
                    attempts,
                    policy.max_review_attempts,
                    issues.join("; ")
                ),
            ),
            RejectionOutcome::Escalated { attempts } => (
                ActivityKind::TaskEscalated,
                format!("Escalated after {} rejected reviews", attempts),
            ),
        };
        self.log(Activity::new(now, kind, message).with_task(task_id));
        Ok(outcome)
    }

    /// Apply exactly one strategist decision to an escalated task and audit it.
    pub fn apply_resolution(
        &mut self,
        task_id: &str,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, TaskError> {
        self.expect_status(task_id, &[TaskStatus::Escalated], "resolve")?;
        let task = self.task_mut(task_id)?;
        task.escalated = false;

        match resolution.decision {
            EscalationDecision::DifferentApproach => {
                task.status = TaskStatus::InProgress;
                task.review_attempts = 0;
                task.strategist_guidance = Some(
                    resolution
                        .guidance
                        .clone()
                        .unwrap_or_else(|| resolution.reasoning.clone()),
                );
            }
            EscalationDecision::SkipTask => {
                task.status = TaskStatus::Skipped;
                task.skip_reason = Some(resolution.reasoning.clone());
                task.backlog_note = resolution.backlog_note.clone();
            }
            EscalationDecision::ModifySpec => {
                task.status = TaskStatus::NeedsHuman;
                task.human_needed = Some(format!(
                    "Spec modification required: {}",
                    resolution
                        .human_needed
                        .as_deref()
                        .unwrap_or(&resolution.reasoning)
                ));
            }
            EscalationDecision::NeedHuman => {
                task.status = TaskStatus::NeedsHuman;
                task.human_needed = Some(
                    resolution
                        .human_needed
                        .clone()
                        .unwrap_or_else(|| resolution.reasoning.clone()),
                );
                task.human_options = resolution.human_options.clone();
            }
        }
        let status = task.status;
        let spec_id = task.spec_id.clone();

        if status == TaskStatus::InProgress {
            self.return_to_worker(task_id, now)?;
        } else {
            self.release_holder(task_id, now);
        }

        self.interventions.push(Intervention {
            timestamp: now,
            task_id: task_id.to_string(),
            decision: resolution.decision,
            reasoning: resolution.reasoning.clone(),
        });
        self.log(
            Activity::new(
                now,
                ActivityKind::TaskEscalated,
                format!("Strategist decided {}: {}", resolution.decision, resolution.reasoning),
            )
            .with_task(task_id)
            .with_spec(spec_id),
        );

        if status == TaskStatus::Skipped {
            queue::refresh_queues(self);
        }
        self.refresh_derived(now);
        Ok(status)
    }
}
