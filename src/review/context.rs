//! Inputs handed to the reviewer, strategist and oracle.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::TaskError;
use crate::state::{Intervention, PipelineState, Task, WorkerStatus};
use crate::util::truncate_chars;

/// Spec document characters included in a strategist prompt.
pub const SPEC_TEXT_LIMIT: usize = 10_000;
/// Touched files included in a strategist prompt.
pub const MAX_CONTEXT_FILES: usize = 5;
/// Characters per touched file.
pub const FILE_TEXT_LIMIT: usize = 5_000;

/// Entries listed per top-level directory in the oracle's project layout.
pub const LAYOUT_CHILDREN: usize = 10;
/// Activity entries for the task included in an oracle prompt.
pub const HISTORY_LIMIT: usize = 10;

const SPEC_DOCUMENTS: [&str; 3] = ["srd.md", "spec.md", "README.md"];
pub(crate) const SKIPPED_DIRS: [&str; 2] = ["node_modules", "target"];
const TRUNCATED: &str = "\n[truncated]";

/// Where the documents of `spec_id` live: the spec's recorded directory,
/// else `specs_dir/<spec>`.
pub(crate) fn spec_dir(
    state: &PipelineState,
    spec_id: &str,
    project_dir: &Path,
    specs_dir: &Path,
) -> PathBuf {
    match state.specs.get(spec_id).and_then(|s| s.path.as_deref()) {
        Some(path) => project_dir.join(path),
        None => specs_dir.join(spec_id),
    }
}

/// First spec document in `dir`, truncated to `limit` characters.
pub(crate) fn first_spec_document(dir: &Path, limit: usize) -> Option<String> {
    SPEC_DOCUMENTS.iter().find_map(|name| {
        std::fs::read_to_string(dir.join(name))
            .ok()
            .map(|text| truncate_chars(&text, limit, TRUNCATED))
    })
}

fn read_spec_text(
    state: &PipelineState,
    task: &Task,
    project_dir: &Path,
    specs_dir: &Path,
) -> Option<String> {
    let spec_dir = spec_dir(state, &task.spec_id, project_dir, specs_dir);
    let text = first_spec_document(&spec_dir, SPEC_TEXT_LIMIT);
    if text.is_none() {
        debug!(task = %task.id, dir = %spec_dir.display(), "no spec document found");
    }
    text
}

fn spec_name(state: &PipelineState, task: &Task) -> String {
    state
        .specs
        .get(&task.spec_id)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| task.spec_id.clone())
}

fn sorted_names(dir: &Path) -> Vec<(String, bool)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<(String, bool)> = entries
        .filter_map(|e| e.ok())
        .map(|e| {
            let is_dir = e.file_type().is_ok_and(|t| t.is_dir());
            (e.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .filter(|(name, _)| !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_str()))
        .collect();
    names.sort();
    names
}

/// Two-level listing of the project: top-level entries, and up to
/// [`LAYOUT_CHILDREN`] children of each top-level directory.
pub fn project_layout(project_dir: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for (name, is_dir) in sorted_names(project_dir) {
        if !is_dir {
            lines.push(name);
            continue;
        }
        lines.push(format!("{}/", name));
        let children = sorted_names(&project_dir.join(&name));
        for (child, child_is_dir) in children.iter().take(LAYOUT_CHILDREN) {
            let suffix = if *child_is_dir { "/" } else { "" };
            lines.push(format!("  {}{}", child, suffix));
        }
        if children.len() > LAYOUT_CHILDREN {
            lines.push("  ...".to_string());
        }
    }
    lines
}

#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub task: Task,
    pub spec_name: String,
    /// 1-based number of the review about to run
    pub attempt: u32,
    pub max_attempts: u32,
}

impl ReviewContext {
    pub fn new(state: &PipelineState, task_id: &str, max_attempts: u32) -> Result<Self, TaskError> {
        let task = state.task(task_id)?.clone();
        let spec_name = spec_name(state, &task);
        Ok(Self {
            attempt: task.review_attempts + 1,
            task,
            spec_name,
            max_attempts,
        })
    }
}

/// A touched file and its (possibly truncated) contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnippet {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct StrategistContext {
    pub task: Task,
    pub spec_name: String,
    pub spec_text: Option<String>,
    pub files: Vec<FileSnippet>,
    /// Earlier strategist decisions for this task
    pub prior: Vec<Intervention>,
    pub max_attempts: u32,
}

impl StrategistContext {
    /// Collect everything the strategist sees for `task_id`. Spec documents
    /// are looked up in the spec's recorded directory, else `specs_dir/<spec>`.
    pub fn gather(
        state: &PipelineState,
        task_id: &str,
        project_dir: &Path,
        specs_dir: &Path,
        max_attempts: u32,
    ) -> Result<Self, TaskError> {
        let task = state.task(task_id)?.clone();
        let spec_name = spec_name(state, &task);
        let spec_text = read_spec_text(state, &task, project_dir, specs_dir);

        let files = task
            .files_changed
            .iter()
            .filter_map(|path| {
                let content = std::fs::read_to_string(project_dir.join(path)).ok()?;
                Some(FileSnippet {
                    path: path.clone(),
                    content: truncate_chars(&content, FILE_TEXT_LIMIT, TRUNCATED),
                })
            })
            .take(MAX_CONTEXT_FILES)
            .collect();

        let prior = state
            .interventions
            .iter()
            .filter(|i| i.task_id == task.id)
            .cloned()
            .collect();

        Ok(Self {
            task,
            spec_name,
            spec_text,
            files,
            prior,
            max_attempts,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OracleContext {
    pub task: Task,
    pub spec_name: String,
    /// Worker parked on the task, if it has not moved on
    pub worker: Option<String>,
    pub spec_text: Option<String>,
    pub layout: Vec<String>,
    /// Recent activity for the task, oldest first
    pub history: Vec<String>,
}

impl OracleContext {
    pub fn gather(
        state: &PipelineState,
        task_id: &str,
        project_dir: &Path,
        specs_dir: &Path,
    ) -> Result<Self, TaskError> {
        let task = state.task(task_id)?.clone();
        let worker = state
            .workers
            .values()
            .find(|w| w.status == WorkerStatus::Stuck && w.current_task.as_deref() == Some(task_id))
            .map(|w| w.id.clone());
        let mut history: Vec<String> = state
            .activity
            .iter()
            .rev()
            .filter(|a| a.task.as_deref() == Some(task_id))
            .take(HISTORY_LIMIT)
            .map(|a| format!("{} {}", a.timestamp.format("%Y-%m-%d %H:%M:%S"), a.message))
            .collect();
        history.reverse();

        Ok(Self {
            spec_name: spec_name(state, &task),
            spec_text: read_spec_text(state, &task, project_dir, specs_dir),
            layout: project_layout(project_dir),
            worker,
            history,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EscalationDecision, Spec, Stage};
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    fn state_with_files(files: Vec<String>) -> PipelineState {
        let mut task = Task::new("auth-002", "auth", "Login API", Stage::Backend);
        task.files_changed = files;
        task.review_attempts = 2;
        PipelineState::seeded(
            "shop",
            30,
            vec![Spec::new("auth", "Authentication").with_path(".foreman/specs/auth")],
            vec![task],
            vec![],
            Utc::now(),
        )
    }

    #[test]
    fn test_review_context_attempt_is_next_review() {
        let state = state_with_files(vec![]);
        let ctx = ReviewContext::new(&state, "auth-002", 3).unwrap();
        assert_eq!(ctx.attempt, 3);
        assert_eq!(ctx.spec_name, "Authentication");
    }

    #[test]
    fn test_gather_reads_spec_and_files() {
        let dir = tempdir().unwrap();
        let spec_dir = dir.path().join(".foreman/specs/auth");
        fs::create_dir_all(&spec_dir).unwrap();
        fs::write(spec_dir.join("spec.md"), "# Authentication\nUsers log in.").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/login.rs"), "x".repeat(FILE_TEXT_LIMIT + 100)).unwrap();

        let mut state = state_with_files(vec!["src/login.rs".into(), "src/missing.rs".into()]);
        state.interventions.push(Intervention {
            timestamp: Utc::now(),
            task_id: "auth-002".into(),
            decision: EscalationDecision::DifferentApproach,
            reasoning: "try sessions".into(),
        });

        let ctx = StrategistContext::gather(
            &state,
            "auth-002",
            dir.path(),
            &dir.path().join(".foreman/specs"),
            3,
        )
        .unwrap();
        assert!(ctx.spec_text.unwrap().contains("Users log in."));
        assert_eq!(ctx.files.len(), 1);
        assert!(ctx.files[0].content.ends_with("[truncated]"));
        assert_eq!(ctx.prior.len(), 1);
    }

    #[test]
    fn test_gather_without_documents() {
        let dir = tempdir().unwrap();
        let state = state_with_files(vec![]);
        let ctx =
            StrategistContext::gather(&state, "auth-002", dir.path(), dir.path(), 3).unwrap();
        assert!(ctx.spec_text.is_none());
        assert!(ctx.files.is_empty());
    }

    #[test]
    fn test_gather_unknown_task() {
        let dir = tempdir().unwrap();
        let state = state_with_files(vec![]);
        assert!(matches!(
            StrategistContext::gather(&state, "nope", dir.path(), dir.path(), 3),
            Err(TaskError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_project_layout_skips_hidden_and_build_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".foreman/specs")).unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::create_dir_all(dir.path().join("migrations")).unwrap();
        for i in 0..12 {
            fs::write(dir.path().join(format!("migrations/{:03}.sql", i)), "").unwrap();
        }
        fs::write(dir.path().join("Cargo.toml"), "").unwrap();

        let layout = project_layout(dir.path());
        assert_eq!(layout[0], "Cargo.toml");
        assert_eq!(layout[1], "migrations/");
        assert_eq!(layout[2], "  000.sql");
        assert_eq!(layout.last().unwrap(), "  ...");
        assert!(!layout.iter().any(|l| l.contains("target") || l.contains(".foreman")));
    }

    #[test]
    fn test_oracle_context_finds_parked_worker_and_history() {
        use crate::state::{Activity, ActivityKind, TaskStatus, Worker};

        let dir = tempdir().unwrap();
        let mut state = state_with_files(vec![]);
        state.tasks.get_mut("auth-002").unwrap().status = TaskStatus::Stuck;
        let mut worker = Worker::new("fm-backend", Stage::Backend, Utc::now());
        worker.status = WorkerStatus::Stuck;
        worker.current_task = Some("auth-002".into());
        state.workers.insert(worker.id.clone(), worker);
        state.log(
            Activity::new(Utc::now(), ActivityKind::TaskStuck, "Stuck after 3 failures: 401s")
                .with_task("auth-002"),
        );

        let ctx = OracleContext::gather(&state, "auth-002", dir.path(), dir.path()).unwrap();
        assert_eq!(ctx.worker.as_deref(), Some("fm-backend"));
        assert_eq!(ctx.history.len(), 1);
        assert!(ctx.history[0].ends_with("Stuck after 3 failures: 401s"));
    }
}
