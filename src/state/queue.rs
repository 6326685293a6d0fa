//! Dependency gating and per-stage ready queues.
//!
//! A task id sits in its stage's queue iff the task is `pending` and every
//! dependency has settled as merged or skipped. [`refresh_queues`] restores
//! that invariant on any state: it drops stale entries and appends newly
//! eligible tasks in id order, so running it twice is the same as running it
//! once.

use super::model::{PipelineState, Stage, Task, TaskStatus};

/// Dependency ids of `task` that are missing or not yet complete.
pub fn unmet_dependencies(task: &Task, state: &PipelineState) -> Vec<String> {
    task.depends_on
        .iter()
        .filter(|dep| {
            !state
                .tasks
                .get(dep.as_str())
                .is_some_and(|t| t.status.satisfies_dependents())
        })
        .cloned()
        .collect()
}

/// True iff every dependency is complete. Empty dependency lists are always satisfied.
pub fn dependencies_satisfied(task: &Task, state: &PipelineState) -> bool {
    unmet_dependencies(task, state).is_empty()
}

/// Whether a task belongs in its stage queue right now.
pub fn is_ready(task: &Task, state: &PipelineState) -> bool {
    task.status == TaskStatus::Pending && dependencies_satisfied(task, state)
}

/// Bring every stage queue in line with the task table. Returns true if anything changed.
pub fn refresh_queues(state: &mut PipelineState) -> bool {
    let mut retained: Vec<(Stage, Vec<String>)> = Vec::with_capacity(Stage::ALL.len());
    let mut seen = std::collections::HashSet::new();
    let mut changed = false;

    for stage in Stage::ALL {
        let current = state.queues.get(&stage).cloned().unwrap_or_default();
        let before = current.len();
        let kept: Vec<String> = current
            .into_iter()
            .filter(|id| {
                state
                    .tasks
                    .get(id.as_str())
                    .is_some_and(|t| t.stage == stage && is_ready(t, state))
                    && seen.insert(id.clone())
            })
            .collect();
        changed |= kept.len() != before;
        retained.push((stage, kept));
    }

    for (stage, mut queue) in retained {
        for task in state.tasks.values() {
            if task.stage == stage && !seen.contains(&task.id) && is_ready(task, state) {
                seen.insert(task.id.clone());
                queue.push(task.id.clone());
                changed = true;
            }
        }
        state.queues.insert(stage, queue);
    }

    changed
}

/// Remove a task id from whichever queue holds it.
pub fn remove_from_queues(state: &mut PipelineState, task_id: &str) {
    for queue in state.queues.values_mut() {
        queue.retain(|id| id != task_id);
    }
}

/// Next ready task for a stage when its queue is empty: first eligible by id order.
pub fn fallback_candidate(state: &PipelineState, stage: Stage) -> Option<String> {
    state
        .tasks
        .values()
        .find(|t| t.stage == stage && is_ready(t, state))
        .map(|t| t.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{Spec, Worker};
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    /// One spec with a database → backend → frontend → testing chain.
    fn chain() -> PipelineState {
        PipelineState::seeded(
            "shop",
            30,
            vec![Spec::new("auth", "Auth")],
            vec![
                Task::new("auth-001", "auth", "Users table", Stage::Database),
                Task::new("auth-002", "auth", "Login endpoint", Stage::Backend)
                    .with_dependencies(["auth-001"]),
                Task::new("auth-003", "auth", "Login page", Stage::Frontend)
                    .with_dependencies(["auth-002"]),
                Task::new("auth-004", "auth", "Login e2e test", Stage::Testing)
                    .with_dependencies(["auth-003"]),
            ],
            vec![Worker::new("fm-database", Stage::Database, now())],
            now(),
        )
    }

    fn set_status(state: &mut PipelineState, id: &str, status: TaskStatus) {
        state.tasks.get_mut(id).unwrap().status = status;
    }

    #[test]
    fn test_empty_dependencies_are_satisfied() {
        let state = chain();
        assert!(dependencies_satisfied(&state.tasks["auth-001"], &state));
        assert!(!dependencies_satisfied(&state.tasks["auth-002"], &state));
    }

    #[test]
    fn test_unknown_dependency_is_unmet() {
        let state = chain();
        let orphan = Task::new("x", "auth", "x", Stage::Backend).with_dependencies(["ghost"]);
        assert_eq!(unmet_dependencies(&orphan, &state), vec!["ghost"]);
    }

    #[test]
    fn test_completed_awaiting_review_does_not_satisfy() {
        let mut state = chain();
        set_status(&mut state, "auth-001", TaskStatus::Completed);
        assert!(!dependencies_satisfied(&state.tasks["auth-002"], &state));
        set_status(&mut state, "auth-001", TaskStatus::Skipped);
        assert!(dependencies_satisfied(&state.tasks["auth-002"], &state));
    }

    #[test]
    fn test_initial_queues_hold_only_the_database_task() {
        let state = chain();
        assert_eq!(state.queues[&Stage::Database], vec!["auth-001"]);
        for stage in [Stage::Backend, Stage::Frontend, Stage::Testing] {
            assert!(state.queues[&stage].is_empty(), "{} queue not empty", stage);
        }
    }

    #[test]
    fn test_refresh_unlocks_successor_only() {
        let mut state = chain();
        set_status(&mut state, "auth-001", TaskStatus::Merged);
        assert!(refresh_queues(&mut state));
        assert!(state.queues[&Stage::Database].is_empty());
        assert_eq!(state.queues[&Stage::Backend], vec!["auth-002"]);
        assert!(state.queues[&Stage::Frontend].is_empty());
        assert!(state.queues[&Stage::Testing].is_empty());
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut state = chain();
        set_status(&mut state, "auth-001", TaskStatus::Merged);
        refresh_queues(&mut state);
        let once = state.queues.clone();
        assert!(!refresh_queues(&mut state));
        assert_eq!(state.queues, once);
    }

    #[test]
    fn test_refresh_heals_stale_and_duplicate_entries() {
        let mut state = chain();
        state
            .queues
            .get_mut(&Stage::Testing)
            .unwrap()
            .push("auth-004".into());
        state
            .queues
            .get_mut(&Stage::Backend)
            .unwrap()
            .push("auth-001".into());
        state
            .queues
            .get_mut(&Stage::Database)
            .unwrap()
            .push("auth-001".into());

        assert!(refresh_queues(&mut state));
        assert_eq!(state.queues[&Stage::Database], vec!["auth-001"]);
        assert!(state.queues[&Stage::Backend].is_empty());
        assert!(state.queues[&Stage::Testing].is_empty());
    }

    #[test]
    fn test_refresh_preserves_existing_order() {
        let mut state = chain();
        state.tasks.insert(
            "auth-000".into(),
            Task::new("auth-000", "auth", "Sessions table", Stage::Database),
        );
        refresh_queues(&mut state);
        // Existing entry keeps its place; the newcomer is appended.
        assert_eq!(state.queues[&Stage::Database], vec!["auth-001", "auth-000"]);
    }

    #[test]
    fn test_fallback_candidate_respects_stage_and_dependencies() {
        let mut state = chain();
        assert_eq!(
            fallback_candidate(&state, Stage::Database),
            Some("auth-001".to_string())
        );
        assert_eq!(fallback_candidate(&state, Stage::Backend), None);
        set_status(&mut state, "auth-001", TaskStatus::Merged);
        assert_eq!(
            fallback_candidate(&state, Stage::Backend),
            Some("auth-002".to_string())
        );
    }

    #[test]
    fn test_remove_from_queues() {
        let mut state = chain();
        remove_from_queues(&mut state, "auth-001");
        assert!(state.queues[&Stage::Database].is_empty());
    }
}
