//! Persisted pipeline document types.
//!
//! Everything the coordinator knows lives in one [`PipelineState`] document:
//! tasks, workers, specs, the per-stage ready queues, the bounded activity log,
//! the escalation interventions log and the derived stats. The document is
//! serialized as camelCase JSON so external tools can read it directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::TaskError;

/// Schema version written into every document.
pub const STATE_VERSION: &str = "1";

/// One phase of the fixed pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Database,
    Backend,
    Frontend,
    Testing,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::Database,
        Stage::Backend,
        Stage::Frontend,
        Stage::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Database => "database",
            Stage::Backend => "backend",
            Stage::Frontend => "frontend",
            Stage::Testing => "testing",
        }
    }

    pub fn next(self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn previous(self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        idx.checked_sub(1).map(|i| Self::ALL[i])
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "database" | "db" => Ok(Stage::Database),
            "backend" | "api" => Ok(Stage::Backend),
            "frontend" | "ui" => Ok(Stage::Frontend),
            "testing" | "test" | "tests" => Ok(Stage::Testing),
            _ => anyhow::bail!(
                "Invalid stage '{}'. Valid values: database, backend, frontend, testing",
                s
            ),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a worker
    Pending,
    /// Handed to a worker, not yet acknowledged
    Assigned,
    /// Worker reported it started
    InProgress,
    /// Worker is running its own checks
    Verifying,
    /// Worker finished; awaiting review
    Completed,
    /// Review attempts exhausted; awaiting a strategist decision
    Escalated,
    /// Branch merged into main
    Merged,
    /// Strategist chose to skip the task
    Skipped,
    /// Retries exhausted; revivable
    Stuck,
    /// Only a human can move this forward
    NeedsHuman,
}

impl TaskStatus {
    /// Whether dependents may proceed as if this task were complete.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, TaskStatus::Merged | TaskStatus::Skipped)
    }

    /// Whether a worker is actively holding the task.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Verifying
        )
    }

    /// Whether the task is waiting on the review/escalation machine.
    pub fn awaiting_review(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Escalated)
    }

    /// Whether the task no longer needs anything from the pipeline.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Merged | TaskStatus::Skipped | TaskStatus::Stuck | TaskStatus::NeedsHuman
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Completed => "completed",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Merged => "merged",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Stuck => "stuck",
            TaskStatus::NeedsHuman => "needs_human",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Verifying,
    Stuck,
    Offline,
}

impl WorkerStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, WorkerStatus::Working | WorkerStatus::Verifying)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Verifying => "verifying",
            WorkerStatus::Stuck => "stuck",
            WorkerStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
}

/// Overall pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Initializing,
    Running,
    Paused,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    #[default]
    Active,
    Paused,
    Stopped,
}

/// One of the four bounded strategist decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationDecision {
    DifferentApproach,
    SkipTask,
    ModifySpec,
    NeedHuman,
}

impl fmt::Display for EscalationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationDecision::DifferentApproach => "DIFFERENT_APPROACH",
            EscalationDecision::SkipTask => "SKIP_TASK",
            EscalationDecision::ModifySpec => "MODIFY_SPEC",
            EscalationDecision::NeedHuman => "NEED_HUMAN",
        };
        f.write_str(s)
    }
}

/// A unit of work bound to one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub spec_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub stage: Stage,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Branch the worker commits to; fixed at first assignment
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub review_attempts: u32,
    #[serde(default)]
    pub review_issues: Vec<String>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategist_guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_needed: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub human_options: Vec<String>,
    /// Oracle advice for the current stuck episode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_guidance: Option<OracleNote>,
    /// Evidence that the work already existed when the plan was reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<String>,
}

/// Advice the oracle gave for a stuck task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleNote {
    pub provided_at: DateTime<Utc>,
    pub analysis: String,
    pub guidance: String,
    /// The oracle thinks only a human can unblock the task
    #[serde(default)]
    pub escalate: bool,
    /// Guidance document, relative to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        spec_id: impl Into<String>,
        title: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self {
            id: id.into(),
            spec_id: spec_id.into(),
            title: title.into(),
            description: String::new(),
            stage,
            status: TaskStatus::Pending,
            assigned_to: None,
            branch: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            merged_at: None,
            retry_count: 0,
            depends_on: Vec::new(),
            files_changed: Vec::new(),
            review_attempts: 0,
            review_issues: Vec::new(),
            escalated: false,
            strategist_guidance: None,
            failure_reason: None,
            stuck_reason: None,
            skip_reason: None,
            backlog_note: None,
            human_needed: None,
            human_options: Vec::new(),
            oracle_guidance: None,
            reconciled: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A logical executor bound to one stage and one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub session: String,
    pub stage: Stage,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub current_spec: Option<String>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nudged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
}

impl Worker {
    pub fn new(id: impl Into<String>, stage: Stage, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            session: id.clone(),
            id,
            stage,
            status: WorkerStatus::Idle,
            current_task: None,
            current_spec: None,
            last_activity: now,
            nudged_at: None,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Drop the current task and go back to idle.
    pub(crate) fn release(&mut self, now: DateTime<Utc>) {
        self.status = WorkerStatus::Idle;
        self.current_task = None;
        self.current_spec = None;
        self.nudged_at = None;
        self.last_activity = now;
    }

    /// Bind a task and mark the worker busy.
    pub(crate) fn bind(&mut self, task: &Task, status: WorkerStatus, now: DateTime<Utc>) {
        self.status = status;
        self.current_task = Some(task.id.clone());
        self.current_spec = Some(task.spec_id.clone());
        self.nudged_at = None;
        self.last_activity = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageProgress {
    pub total: u32,
    pub complete: u32,
}

/// A feature spanning every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub id: String,
    pub name: String,
    /// Directory holding the spec documents, relative to the project root
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub status: SpecStatus,
    #[serde(default)]
    pub progress: BTreeMap<Stage, StageProgress>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Spec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: None,
            status: SpecStatus::Pending,
            progress: BTreeMap::new(),
            completed_at: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Complete iff every stage that has tasks has all of them complete.
    pub fn is_complete(&self) -> bool {
        let mut any = false;
        for p in self.progress.values().filter(|p| p.total > 0) {
            any = true;
            if p.complete < p.total {
                return false;
            }
        }
        any
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    TaskAssigned,
    TaskStarted,
    TaskVerifying,
    TaskCompleted,
    TaskFailed,
    TaskStuck,
    TaskMerged,
    TaskRejected,
    TaskEscalated,
    TaskRevived,
    TaskReconciled,
    OracleGuidance,
    WorkerIdle,
    WorkerNudged,
    WorkerOffline,
    WorkerRestarted,
    SpecCompleted,
    OrchestratorPoll,
    System,
}

/// One observability event. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    pub message: String,
}

impl Activity {
    pub fn new(now: DateTime<Utc>, kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: now,
            kind,
            worker: None,
            task: None,
            spec: None,
            message: message.into(),
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_spec(mut self, spec: impl Into<String>) -> Self {
        self.spec = Some(spec.into());
        self
    }
}

/// Audit record of one strategist decision. Authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub decision: EscalationDecision,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorInfo {
    pub status: OrchestratorStatus,
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub total_polls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_tasks: u32,
    /// Merged tasks
    pub completed_tasks: u32,
    pub skipped_tasks: u32,
    /// Failure reports received, including retried ones
    pub failed_tasks: u32,
    pub stuck_tasks: u32,
    pub needs_human_tasks: u32,
    pub total_specs: u32,
    pub completed_specs: u32,
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub version: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: RunStatus,
    pub orchestrator: OrchestratorInfo,
    pub workers: BTreeMap<String, Worker>,
    pub specs: BTreeMap<String, Spec>,
    pub tasks: BTreeMap<String, Task>,
    pub queues: BTreeMap<Stage, Vec<String>>,
    #[serde(default)]
    pub activity: Vec<Activity>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
    #[serde(default)]
    pub stats: Stats,
}

impl PipelineState {
    /// Empty document with one (empty) queue per stage.
    pub fn new(project: impl Into<String>, poll_interval_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.into(),
            started_at: now,
            last_updated: now,
            status: RunStatus::Initializing,
            orchestrator: OrchestratorInfo {
                status: OrchestratorStatus::Active,
                last_poll: None,
                poll_interval_secs,
                total_polls: 0,
            },
            workers: BTreeMap::new(),
            specs: BTreeMap::new(),
            tasks: BTreeMap::new(),
            queues: Stage::ALL.iter().map(|s| (*s, Vec::new())).collect(),
            activity: Vec::new(),
            interventions: Vec::new(),
            stats: Stats::default(),
        }
    }

    /// Build a fresh document from ingested specs, tasks and workers, with queues seeded.
    pub fn seeded(
        project: impl Into<String>,
        poll_interval_secs: u64,
        specs: Vec<Spec>,
        tasks: Vec<Task>,
        workers: Vec<Worker>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self::new(project, poll_interval_secs, now);
        state.specs = specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        state.tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        state.workers = workers.into_iter().map(|w| (w.id.clone(), w)).collect();
        super::queue::refresh_queues(&mut state);
        state.refresh_derived(now);
        let message = format!(
            "Pipeline initialized with {} specs, {} tasks, {} workers",
            state.specs.len(),
            state.tasks.len(),
            state.workers.len()
        );
        state.log(Activity::new(now, ActivityKind::System, message));
        state
    }

    pub fn log(&mut self, entry: Activity) {
        self.activity.push(entry);
    }

    /// Keep only the most recent `limit` activity entries.
    pub fn truncate_activity(&mut self, limit: usize) {
        if self.activity.len() > limit {
            let excess = self.activity.len() - limit;
            self.activity.drain(..excess);
        }
    }

    pub fn task(&self, id: &str) -> Result<&Task, TaskError> {
        self.tasks
            .get(id)
            .ok_or_else(|| TaskError::UnknownTask(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut Task, TaskError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::UnknownTask(id.to_string()))
    }

    pub fn worker(&self, id: &str) -> Result<&Worker, TaskError> {
        self.workers
            .get(id)
            .ok_or_else(|| TaskError::UnknownWorker(id.to_string()))
    }

    pub fn worker_mut(&mut self, id: &str) -> Result<&mut Worker, TaskError> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| TaskError::UnknownWorker(id.to_string()))
    }

    /// Tasks in a given status, in id order.
    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |t| t.status == status)
    }

    /// Every task has settled (merged, skipped, stuck or needs a human).
    pub fn is_complete(&self) -> bool {
        let s = &self.stats;
        s.completed_tasks + s.skipped_tasks + s.stuck_tasks + s.needs_human_tasks >= s.total_tasks
    }

    pub fn is_paused(&self) -> bool {
        self.orchestrator.status == OrchestratorStatus::Paused
    }

    /// Recompute spec progress/status and stats from the task table.
    ///
    /// `failedTasks` is an event counter and is left untouched.
    pub fn refresh_derived(&mut self, now: DateTime<Utc>) {
        let mut progress: BTreeMap<&str, BTreeMap<Stage, StageProgress>> = BTreeMap::new();
        let mut started: BTreeMap<&str, bool> = BTreeMap::new();
        for task in self.tasks.values() {
            let entry = progress
                .entry(task.spec_id.as_str())
                .or_default()
                .entry(task.stage)
                .or_default();
            entry.total += 1;
            if task.status.satisfies_dependents() {
                entry.complete += 1;
            }
            if task.status != TaskStatus::Pending || task.retry_count > 0 {
                started.insert(task.spec_id.as_str(), true);
            }
        }

        let mut completed_now = Vec::new();
        for spec in self.specs.values_mut() {
            spec.progress = progress.remove(spec.id.as_str()).unwrap_or_default();
            let was_complete = spec.status == SpecStatus::Complete;
            if spec.is_complete() {
                spec.status = SpecStatus::Complete;
                if !was_complete {
                    spec.completed_at = Some(now);
                    completed_now.push((spec.id.clone(), spec.name.clone()));
                }
            } else if started.contains_key(spec.id.as_str()) {
                spec.status = SpecStatus::InProgress;
                spec.completed_at = None;
            } else {
                spec.status = SpecStatus::Pending;
                spec.completed_at = None;
            }
        }
        for (id, name) in completed_now {
            self.log(
                Activity::new(now, ActivityKind::SpecCompleted, format!("Spec completed: {}", name))
                    .with_spec(id),
            );
        }

        let count = |status: TaskStatus| {
            self.tasks.values().filter(|t| t.status == status).count() as u32
        };
        self.stats = Stats {
            total_tasks: self.tasks.len() as u32,
            completed_tasks: count(TaskStatus::Merged),
            skipped_tasks: count(TaskStatus::Skipped),
            failed_tasks: self.stats.failed_tasks,
            stuck_tasks: count(TaskStatus::Stuck),
            needs_human_tasks: count(TaskStatus::NeedsHuman),
            total_specs: self.specs.len() as u32,
            completed_specs: self
                .specs
                .values()
                .filter(|s| s.status == SpecStatus::Complete)
                .count() as u32,
        };
    }
}
