//! The poll loop.
//!
//! Each tick runs, in order:
//!
//! 1. record the poll (timestamp, counter, activity entry)
//! 2. oracle pass over stuck tasks, freeing their workers
//! 3. load the document
//! 4. completion check: every task merged, skipped, stuck or waiting on a human
//! 5. status log
//! 6. review pass over completed and escalated tasks
//! 7. assign idle workers
//! 8. nudge inactive workers
//! 9. refresh queues
//! 10. check worker sessions
//!
//! Every mutating step goes through its own store update. A failing step is
//! logged and the tick moves on; only a corrupt state document stops the loop.
//! While the orchestrator is paused a tick records the poll and nothing else.
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::config::Config;
//! use foreman::orchestrator::Orchestrator;
//! use std::path::PathBuf;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::new(PathBuf::from("."))?;
//! let orchestrator = Orchestrator::from_config(&config);
//! let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! orchestrator.run(stop_rx).await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{StoreError, is_fatal};
use crate::liveness::{LivenessMonitor, LivenessReport};
use crate::review::{
    ClaudeCli, ClaudeOracle, ClaudeReviewer, ClaudeStrategist, EscalationMachine,
    EscalationSettings, OracleDesk, OraclePassReport, OracleSettings, ReviewPassReport,
};
use crate::scheduler::Scheduler;
use crate::session::{SessionRunner, TmuxRunner};
use crate::state::{OrchestratorStatus, PipelineState, Stage, StateStore, TaskStatus, queue};
use crate::tracker::GitTracker;

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work remains; keep polling
    Continue,
    /// Paused by the operator; only the poll was recorded
    Paused,
    /// Every task has settled
    Complete,
    /// Stop requested through the state document
    Stopped,
}

impl TickOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TickOutcome::Complete | TickOutcome::Stopped)
    }
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub poll: u64,
    pub outcome: TickOutcome,
    pub oracle: OraclePassReport,
    pub review: ReviewPassReport,
    pub assigned: Vec<String>,
    pub nudged: Vec<String>,
    pub queues_changed: bool,
    pub liveness: LivenessReport,
}

impl TickReport {
    fn new(poll: u64, outcome: TickOutcome) -> Self {
        Self {
            poll,
            outcome,
            oracle: OraclePassReport::default(),
            review: ReviewPassReport::default(),
            assigned: Vec::new(),
            nudged: Vec::new(),
            queues_changed: false,
            liveness: LivenessReport::default(),
        }
    }
}

/// Log a failed step and carry on, unless the failure is fatal.
fn step<T: Default>(name: &'static str, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            warn!(step = name, error = %e, "poll step failed");
            Ok(T::default())
        }
    }
}

fn log_summary(state: &PipelineState) {
    let s = &state.stats;
    info!(
        merged = s.completed_tasks,
        skipped = s.skipped_tasks,
        stuck = s.stuck_tasks,
        needs_human = s.needs_human_tasks,
        total = s.total_tasks,
        "all tasks settled"
    );
    for task in state.tasks_with_status(TaskStatus::Stuck) {
        warn!(
            task = %task.id,
            reason = task.stuck_reason.as_deref().unwrap_or("unknown"),
            "stuck: retries exhausted, revive with `foreman revive`"
        );
    }
    for task in state.tasks_with_status(TaskStatus::NeedsHuman) {
        warn!(
            task = %task.id,
            needed = task.human_needed.as_deref().unwrap_or("a decision"),
            "needs human"
        );
    }
}

fn log_status(poll: u64, state: &PipelineState) {
    let s = &state.stats;
    let busy = state.workers.values().filter(|w| w.status.is_busy()).count();
    info!(
        poll,
        merged = s.completed_tasks,
        total = s.total_tasks,
        stuck = s.stuck_tasks,
        needs_human = s.needs_human_tasks,
        busy_workers = busy,
        "pipeline status"
    );
    for stage in Stage::ALL {
        let queued = state.queues.get(&stage).map_or(0, Vec::len);
        debug!(%stage, queued, "queue");
    }
}

pub struct Orchestrator {
    store: StateStore,
    scheduler: Scheduler,
    liveness: LivenessMonitor,
    review: EscalationMachine,
    oracle: OracleDesk,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        scheduler: Scheduler,
        liveness: LivenessMonitor,
        review: EscalationMachine,
        oracle: OracleDesk,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            liveness,
            review,
            oracle,
            poll_interval,
        }
    }

    /// Wire the production collaborators: tmux sessions, the claude CLI and git.
    pub fn from_config(config: &Config) -> Self {
        let store = config.store();
        let policy = config.task_policy();
        let toml = &config.toml;

        let sessions: Arc<dyn SessionRunner> = Arc::new(TmuxRunner::from_config(config));
        let cli = ClaudeCli::new(config.claude_cmd())
            .with_working_dir(&config.project_dir)
            .with_timeout(config.review_timeout());
        let git = Arc::new(GitTracker::new(
            &config.project_dir,
            toml.project.main_branch.clone(),
        ));

        let oracle = OracleDesk::new(
            store.clone(),
            Arc::new(ClaudeOracle::new(cli.clone())),
            sessions.clone(),
            OracleSettings {
                project_dir: config.project_dir.clone(),
                specs_dir: config.specs_dir.clone(),
                guidance_dir: config.oracle_dir.clone(),
                enabled: toml.oracle.enabled,
            },
        );
        let review = EscalationMachine::new(
            store.clone(),
            Arc::new(ClaudeReviewer::new(cli.clone(), toml.review.diff_limit)),
            Arc::new(ClaudeStrategist::new(cli)),
            git,
            sessions.clone(),
            policy.clone(),
            EscalationSettings {
                project_dir: config.project_dir.clone(),
                specs_dir: config.specs_dir.clone(),
                issues_dir: config.issues_dir.clone(),
                auto_push: toml.review.auto_push,
            },
        );

        Self::new(
            store.clone(),
            Scheduler::new(store.clone(), sessions.clone(), policy),
            LivenessMonitor::new(store, sessions, config.worker_timeout()),
            review,
            oracle,
            config.poll_interval(),
        )
    }

    /// Run one tick.
    pub async fn poll_once(&self) -> Result<TickReport> {
        let now = Utc::now();
        let (poll, status) = self
            .store
            .update(|state| {
                let poll = state.record_poll(now);
                Ok::<_, StoreError>((poll, state.orchestrator.status))
            })
            .await?;

        match status {
            OrchestratorStatus::Stopped => {
                info!(poll, "stop requested");
                return Ok(TickReport::new(poll, TickOutcome::Stopped));
            }
            OrchestratorStatus::Paused => {
                debug!(poll, "paused; skipping tick");
                return Ok(TickReport::new(poll, TickOutcome::Paused));
            }
            OrchestratorStatus::Active => {}
        }

        let oracle = step("oracle", self.oracle.run_pass().await)?;

        let state = self.store.load().await?;
        if state.is_complete() {
            log_summary(&state);
            self.store
                .update(|state| {
                    state.mark_complete(Utc::now());
                    Ok::<_, StoreError>(())
                })
                .await?;
            let mut report = TickReport::new(poll, TickOutcome::Complete);
            report.oracle = oracle;
            return Ok(report);
        }
        log_status(poll, &state);
        drop(state);

        let mut report = TickReport::new(poll, TickOutcome::Continue);
        report.oracle = oracle;
        report.review = step("review", self.review.run_pass().await)?;
        report.assigned = step("assign", self.scheduler.assign_idle_workers().await)?
            .into_iter()
            .map(|a| a.task.id)
            .collect();
        report.nudged = step("inactivity", self.liveness.check_inactive_workers().await)?;
        report.queues_changed = step(
            "refresh queues",
            self.store
                .update(|state| Ok::<_, StoreError>(queue::refresh_queues(state)))
                .await
                .map_err(anyhow::Error::from),
        )?;
        report.liveness = step("liveness", self.liveness.check_sessions().await)?;

        debug!(
            poll,
            merged = report.review.merged.len(),
            rejected = report.review.rejected.len(),
            advised = report.oracle.advised.len(),
            assigned = report.assigned.len(),
            "tick finished"
        );
        Ok(report)
    }

    /// A fresh run clears a stop request left by a previous one.
    async fn clear_stop_request(&self) -> Result<()> {
        self.store
            .update(|state| {
                if state.orchestrator.status == OrchestratorStatus::Stopped {
                    state.set_orchestrator_status(OrchestratorStatus::Active, Utc::now());
                }
                Ok::<_, StoreError>(())
            })
            .await?;
        Ok(())
    }

    /// Tick every poll interval until completion, a stop request or `shutdown`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<TickOutcome> {
        self.clear_stop_request().await?;

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.poll_interval.as_secs(),
            state = %self.store.path().display(),
            "orchestrator started"
        );

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested");
                return Ok(TickOutcome::Stopped);
            }
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(TickOutcome::Stopped);
                    }
                    continue;
                }
            }

            match self.poll_once().await {
                Ok(report) if report.outcome.is_terminal() => {
                    info!(outcome = ?report.outcome, polls = report.poll, "orchestrator finished");
                    return Ok(report.outcome);
                }
                Ok(_) => {}
                Err(e) if is_fatal(&e) => {
                    error!(error = %e, "state document unusable; stopping");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "poll tick failed"),
            }
        }
    }
}
