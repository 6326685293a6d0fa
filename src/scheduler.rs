//! Assignment scheduler.
//!
//! Pairs every idle worker with a ready task of its stage inside a single
//! store update, so a task can never be handed to two workers: the queue pop
//! and the `pending` check happen under the same lock. The head of the
//! stage queue wins; if the queue is empty the scheduler scans for any ready
//! task of that stage, so a worker never sits idle while eligible work exists
//! in another spec.
//!
//! Session notification happens after the update commits. A failed
//! notification is logged and the assignment stands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::TaskError;
use crate::session::{SessionRunner, messages};
use crate::state::{PipelineState, Stage, StateStore, Task, TaskPolicy, WorkerStatus, queue};

/// One committed worker/task pairing.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker_id: String,
    pub session: String,
    pub task: Task,
}

/// Pop queue entries for `stage` until one is still ready.
fn next_from_queue(state: &mut PipelineState, stage: Stage) -> Option<String> {
    loop {
        let entries = state.queues.get_mut(&stage)?;
        if entries.is_empty() {
            return None;
        }
        let id = entries.remove(0);
        let ready = state
            .tasks
            .get(&id)
            .is_some_and(|t| t.stage == stage && queue::is_ready(t, state));
        if ready {
            return Some(id);
        }
        debug!(task = %id, %stage, "dropping stale queue entry");
    }
}

/// Assign ready tasks to idle workers, in worker-id order.
pub fn plan_assignments(
    state: &mut PipelineState,
    policy: &TaskPolicy,
    now: DateTime<Utc>,
) -> Vec<Assignment> {
    let idle: Vec<(String, Stage)> = state
        .workers
        .values()
        .filter(|w| w.status == WorkerStatus::Idle)
        .map(|w| (w.id.clone(), w.stage))
        .collect();

    let mut assignments = Vec::new();
    for (worker_id, stage) in idle {
        let candidate = next_from_queue(state, stage).or_else(|| {
            let found = queue::fallback_candidate(state, stage);
            if let Some(id) = &found {
                debug!(worker = %worker_id, task = %id, "assigning outside queue order");
            }
            found
        });

        let Some(task_id) = candidate else {
            debug!(worker = %worker_id, %stage, "no ready task");
            continue;
        };

        match state.assign_task(&task_id, &worker_id, policy, now) {
            Ok(()) => {
                let Some(worker) = state.workers.get(&worker_id) else {
                    continue;
                };
                let Some(task) = state.tasks.get(&task_id) else {
                    continue;
                };
                assignments.push(Assignment {
                    worker_id: worker_id.clone(),
                    session: worker.session.clone(),
                    task: task.clone(),
                });
            }
            Err(e) => warn!(worker = %worker_id, task = %task_id, error = %e, "assignment rejected"),
        }
    }
    assignments
}

/// Drives assignment against the store and notifies sessions.
pub struct Scheduler {
    store: StateStore,
    sessions: Arc<dyn SessionRunner>,
    policy: TaskPolicy,
}

impl Scheduler {
    pub fn new(store: StateStore, sessions: Arc<dyn SessionRunner>, policy: TaskPolicy) -> Self {
        Self {
            store,
            sessions,
            policy,
        }
    }

    pub async fn assign_idle_workers(&self) -> Result<Vec<Assignment>> {
        let policy = &self.policy;
        let assignments = self
            .store
            .update(|state| Ok::<_, TaskError>(plan_assignments(state, policy, Utc::now())))
            .await?;

        for a in &assignments {
            info!(worker = %a.worker_id, task = %a.task.id, stage = %a.task.stage, "task assigned");
            let message = messages::assignment_message(&a.task);
            if let Err(e) = self.sessions.send(&a.session, &message).await {
                warn!(worker = %a.worker_id, task = %a.task.id, error = %e, "could not notify worker");
            }
        }
        Ok(assignments)
    }
}
