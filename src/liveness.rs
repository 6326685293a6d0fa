//! Liveness and stall detection.
//!
//! Two independent checks run every poll tick:
//!
//! - **Inactivity**: a busy worker whose last activity is older than the
//!   worker timeout gets a status-check nudge. Nothing changes status; the
//!   worker's progress is self-reported and a slow worker looks the same as a
//!   stuck one until it answers. A worker is nudged at most once per timeout
//!   window.
//! - **Session liveness**: every worker that is not already offline has its
//!   session checked. A dead session marks the worker offline and is
//!   restarted once. Its task goes back to the queue without counting as a
//!   failure. A failed restart leaves the worker offline for
//!   `foreman worker restart`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::TaskError;
use crate::session::{SessionRunner, messages};
use crate::state::{
    Activity, ActivityKind, PipelineState, StateStore, Worker, WorkerStatus,
};

/// Busy workers overdue for a nudge.
pub fn inactive_workers(
    state: &PipelineState,
    timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<Worker> {
    state
        .workers
        .values()
        .filter(|w| w.status.is_busy())
        .filter(|w| {
            // Finished work waiting on review is not the worker's delay.
            w.current_task
                .as_deref()
                .and_then(|id| state.tasks.get(id))
                .is_none_or(|t| !t.status.awaiting_review())
        })
        .filter(|w| now - w.last_activity > timeout)
        .filter(|w| w.nudged_at.is_none_or(|at| now - at > timeout))
        .cloned()
        .collect()
}

/// What a liveness pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub nudged: Vec<String>,
    pub restarted: Vec<String>,
    pub offline: Vec<String>,
}

pub struct LivenessMonitor {
    store: StateStore,
    sessions: Arc<dyn SessionRunner>,
    worker_timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(
        store: StateStore,
        sessions: Arc<dyn SessionRunner>,
        worker_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            worker_timeout,
        }
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.worker_timeout).unwrap_or(chrono::Duration::MAX)
    }

    /// Nudge workers that have gone quiet.
    pub async fn check_inactive_workers(&self) -> Result<Vec<String>> {
        let Some(state) = self.store.read().await? else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let timeout = self.timeout();
        let mut nudged = Vec::new();

        for worker in inactive_workers(&state, timeout, now) {
            let idle_for = now - worker.last_activity;
            let message = messages::nudge_message(&worker, idle_for);
            if let Err(e) = self.sessions.send(&worker.session, &message).await {
                warn!(worker = %worker.id, error = %e, "nudge not delivered");
                continue;
            }
            info!(worker = %worker.id, minutes = idle_for.num_minutes(), "nudged inactive worker");

            let id = worker.id.clone();
            self.store
                .update(|state| -> Result<(), TaskError> {
                    let w = state.worker_mut(&id)?;
                    // Skip if the worker reported in between.
                    if w.last_activity != worker.last_activity {
                        return Ok(());
                    }
                    w.nudged_at = Some(now);
                    let task = w.current_task.clone();
                    let mut entry = Activity::new(
                        now,
                        ActivityKind::WorkerNudged,
                        format!("No activity for {} minutes", idle_for.num_minutes()),
                    )
                    .with_worker(&id);
                    if let Some(task) = task {
                        entry = entry.with_task(task);
                    }
                    state.log(entry);
                    Ok(())
                })
                .await?;
            nudged.push(worker.id);
        }
        Ok(nudged)
    }

    /// Check every online worker's session and restart dead ones.
    pub async fn check_sessions(&self) -> Result<LivenessReport> {
        let Some(state) = self.store.read().await? else {
            return Ok(LivenessReport::default());
        };
        let mut report = LivenessReport::default();

        let candidates: Vec<Worker> = state
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Offline)
            .cloned()
            .collect();

        let checks = join_all(
            candidates
                .iter()
                .map(|w| self.sessions.is_alive(&w.session)),
        )
        .await;

        for (worker, check) in candidates.into_iter().zip(checks) {
            match check {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(worker = %worker.id, error = %e, "liveness check failed");
                    continue;
                }
            }

            warn!(worker = %worker.id, session = %worker.session, "session is not running");
            let released = self
                .store
                .update(|state| state.mark_worker_offline(&worker.id, Utc::now()))
                .await?;
            if let Some(task) = released {
                info!(worker = %worker.id, %task, "released task back to queue");
            }

            if self.restart(&worker).await? {
                report.restarted.push(worker.id.clone());
            } else {
                report.offline.push(worker.id.clone());
            }
        }
        Ok(report)
    }

    /// Manually restart a worker's session, e.g. after an automatic restart
    /// failed. A live session is stopped first.
    pub async fn restart_worker(&self, worker_id: &str) -> Result<bool> {
        let worker = self.store.load().await?.worker(worker_id)?.clone();

        if worker.status != WorkerStatus::Offline {
            if let Err(e) = self.sessions.stop(&worker.session).await {
                debug!(worker = %worker.id, error = %e, "stop before restart failed");
            }
            self.store
                .update(|state| state.mark_worker_offline(worker_id, Utc::now()))
                .await?;
        }
        self.restart(&worker).await
    }

    /// Start a fresh session and bootstrap it. Returns false when the worker
    /// stays offline.
    async fn restart(&self, worker: &Worker) -> Result<bool> {
        let started = match self.sessions.start(&worker.session).await {
            Ok(()) => self
                .sessions
                .send(&worker.session, &messages::bootstrap_message(worker))
                .await,
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => {
                info!(worker = %worker.id, "session restarted");
                self.store
                    .update(|state| state.mark_worker_restarted(&worker.id, Utc::now()))
                    .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(worker = %worker.id, error = %e, "session restart failed");
                let message = format!("Restart failed, manual intervention required: {}", e);
                self.store
                    .update(|state| {
                        state.log(
                            Activity::new(Utc::now(), ActivityKind::WorkerOffline, message)
                                .with_worker(&worker.id),
                        );
                        Ok::<_, TaskError>(())
                    })
                    .await?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollaboratorError;
    use crate::state::{Spec, Stage, Task, TaskPolicy, TaskStatus};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeSessions {
        dead: Mutex<HashSet<String>>,
        fail_start: bool,
        sent: Mutex<Vec<(String, String)>>,
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionRunner for FakeSessions {
        async fn start(&self, session: &str) -> Result<(), CollaboratorError> {
            if self.fail_start {
                return Err(CollaboratorError::Transport {
                    collaborator: "session runner",
                    message: "no tmux server".into(),
                });
            }
            self.dead.lock().unwrap().remove(session);
            self.started.lock().unwrap().push(session.to_string());
            Ok(())
        }

        async fn stop(&self, session: &str) -> Result<(), CollaboratorError> {
            self.dead.lock().unwrap().insert(session.to_string());
            Ok(())
        }

        async fn is_alive(&self, session: &str) -> Result<bool, CollaboratorError> {
            Ok(!self.dead.lock().unwrap().contains(session))
        }

        async fn send(&self, session: &str, text: &str) -> Result<(), CollaboratorError> {
            self.sent
                .lock()
                .unwrap()
                .push((session.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn seeded() -> PipelineState {
        let workers = Stage::ALL
            .iter()
            .map(|s| Worker::new(format!("fm-{}", s), *s, now()))
            .collect();
        PipelineState::seeded(
            "shop",
            30,
            vec![Spec::new("auth", "Auth")],
            vec![
                Task::new("auth-001", "auth", "Users table", Stage::Database),
                Task::new("auth-002", "auth", "Login API", Stage::Backend)
                    .with_dependencies(["auth-001"]),
            ],
            workers,
            now(),
        )
    }

    // ===== inactivity =====

    #[test]
    fn test_inactive_worker_detected_after_timeout() {
        let mut state = seeded();
        state
            .assign_task("auth-001", "fm-database", &TaskPolicy::default(), now())
            .unwrap();
        let timeout = chrono::Duration::minutes(10);

        assert!(inactive_workers(&state, timeout, now() + chrono::Duration::minutes(5)).is_empty());
        let late = inactive_workers(&state, timeout, now() + chrono::Duration::minutes(11));
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].id, "fm-database");
    }

    #[test]
    fn test_nudge_is_throttled() {
        let mut state = seeded();
        state
            .assign_task("auth-001", "fm-database", &TaskPolicy::default(), now())
            .unwrap();
        let timeout = chrono::Duration::minutes(10);
        state.workers.get_mut("fm-database").unwrap().nudged_at =
            Some(now() + chrono::Duration::minutes(11));

        assert!(inactive_workers(&state, timeout, now() + chrono::Duration::minutes(15)).is_empty());
        assert_eq!(
            inactive_workers(&state, timeout, now() + chrono::Duration::minutes(22)).len(),
            1
        );
    }

    #[test]
    fn test_awaiting_review_is_not_inactivity() {
        let mut state = seeded();
        let policy = TaskPolicy::default();
        state.assign_task("auth-001", "fm-database", &policy, now()).unwrap();
        state.start_task("auth-001", now()).unwrap();
        state
            .complete_task("auth-001", vec![], &policy, now())
            .unwrap();
        assert_eq!(state.tasks["auth-001"].status, TaskStatus::Completed);

        let late = now() + chrono::Duration::hours(2);
        assert!(inactive_workers(&state, chrono::Duration::minutes(10), late).is_empty());
    }

    #[tokio::test]
    async fn test_check_inactive_workers_sends_and_records_nudge() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = seeded();
        state
            .assign_task("auth-001", "fm-database", &TaskPolicy::default(), now())
            .unwrap();
        store.initialize(state, false).await.unwrap();

        let sessions = Arc::new(FakeSessions::default());
        let monitor = LivenessMonitor::new(
            store.clone(),
            sessions.clone(),
            Duration::from_secs(60),
        );
        let nudged = monitor.check_inactive_workers().await.unwrap();
        assert_eq!(nudged, vec!["fm-database"]);

        let sent = sessions.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "fm-database");

        let state = store.load().await.unwrap();
        assert!(state.workers["fm-database"].nudged_at.is_some());
        assert_eq!(state.workers["fm-database"].status, WorkerStatus::Working);
        assert!(
            state
                .activity
                .iter()
                .any(|a| a.kind == ActivityKind::WorkerNudged)
        );

        // Second pass inside the same window stays quiet.
        assert!(monitor.check_inactive_workers().await.unwrap().is_empty());
    }

    // ===== session liveness =====

    #[tokio::test]
    async fn test_dead_session_is_restarted_and_task_released() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = seeded();
        state
            .assign_task("auth-001", "fm-database", &TaskPolicy::default(), now())
            .unwrap();
        store.initialize(state, false).await.unwrap();

        let sessions = Arc::new(FakeSessions::default());
        sessions.dead.lock().unwrap().insert("fm-database".into());
        let monitor = LivenessMonitor::new(
            store.clone(),
            sessions.clone(),
            Duration::from_secs(600),
        );

        let report = monitor.check_sessions().await.unwrap();
        assert_eq!(report.restarted, vec!["fm-database"]);
        assert!(report.offline.is_empty());

        let state = store.load().await.unwrap();
        let worker = &state.workers["fm-database"];
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(worker.current_task.is_none());
        let task = &state.tasks["auth-001"];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(state.stats.failed_tasks, 0);
        assert_eq!(state.queues[&Stage::Database], vec!["auth-001"]);

        let sent = sessions.sent.lock().unwrap().clone();
        assert!(sent.iter().any(|(s, m)| s == "fm-database" && m.contains("database stage")));
    }

    #[tokio::test]
    async fn test_failed_restart_leaves_worker_offline() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.initialize(seeded(), false).await.unwrap();

        let sessions = Arc::new(FakeSessions {
            fail_start: true,
            ..Default::default()
        });
        sessions.dead.lock().unwrap().insert("fm-testing".into());
        let monitor = LivenessMonitor::new(
            store.clone(),
            sessions.clone(),
            Duration::from_secs(600),
        );

        let report = monitor.check_sessions().await.unwrap();
        assert_eq!(report.offline, vec!["fm-testing"]);

        let state = store.load().await.unwrap();
        assert_eq!(state.workers["fm-testing"].status, WorkerStatus::Offline);
        assert!(
            state
                .activity
                .iter()
                .any(|a| a.message.contains("manual intervention"))
        );

        // Offline workers are not checked again automatically.
        let again = monitor.check_sessions().await.unwrap();
        assert!(again.offline.is_empty() && again.restarted.is_empty());
    }

    #[tokio::test]
    async fn test_manual_restart_recovers_offline_worker() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = seeded();
        state.workers.get_mut("fm-backend").unwrap().status = WorkerStatus::Offline;
        store.initialize(state, false).await.unwrap();

        let sessions = Arc::new(FakeSessions::default());
        let monitor = LivenessMonitor::new(
            store.clone(),
            sessions.clone(),
            Duration::from_secs(600),
        );
        assert!(monitor.restart_worker("fm-backend").await.unwrap());
        assert_eq!(
            store.load().await.unwrap().workers["fm-backend"].status,
            WorkerStatus::Idle
        );
        assert_eq!(sessions.started.lock().unwrap().clone(), vec!["fm-backend"]);
    }

    #[tokio::test]
    async fn test_manual_restart_unknown_worker() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.initialize(seeded(), false).await.unwrap();
        let monitor = LivenessMonitor::new(
            store,
            Arc::new(FakeSessions::default()),
            Duration::from_secs(600),
        );
        assert!(monitor.restart_worker("fm-mobile").await.is_err());
    }
}
