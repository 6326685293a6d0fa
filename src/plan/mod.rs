//! Plan ingestion: turn spec directories into the initial pipeline state.
//!
//! Every directory under `.foreman/specs/` is one spec. Its `tasks.md` is
//! parsed into tasks, numbered `{spec}-{NNN}` in document order. A task
//! depends on every task of the nearest earlier stage that has tasks in the
//! same spec, so stage N+1 of a spec unlocks only when stage N of that spec
//! is done, independently of other specs.
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::plan;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let plan = plan::ingest(Path::new("/work/shop"), Path::new("/work/shop/.foreman/specs"), "fm-")?;
//! println!("{} tasks across {} specs", plan.tasks.len(), plan.specs.len());
//! # Ok(())
//! # }
//! ```

pub mod parser;
pub mod reconcile;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use glob::glob;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::state::{PipelineState, Spec, Stage, Task, Worker};
pub use parser::{ParsedTask, detect_stage, parse_tasks, parse_title};
pub use reconcile::{
    ClaudeReconciler, ReconcileContext, ReconcileReport, Reconciler, TaskAssessment,
    apply_assessments, reconcile,
};

pub const TASKS_FILE: &str = "tasks.md";
const NAME_DOCUMENTS: [&str; 2] = ["srd.md", "spec.md"];

/// Everything needed to seed a fresh state document.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub specs: Vec<Spec>,
    pub tasks: Vec<Task>,
    pub workers: Vec<Worker>,
}

impl Plan {
    pub fn into_state(
        self,
        project: impl Into<String>,
        poll_interval_secs: u64,
        now: DateTime<Utc>,
    ) -> PipelineState {
        PipelineState::seeded(
            project,
            poll_interval_secs,
            self.specs,
            self.tasks,
            self.workers,
            now,
        )
    }

    pub fn tasks_for_stage(&self, stage: Stage) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.stage == stage)
    }
}

/// One worker per stage, named `{prefix}{stage}`.
pub fn default_workers(prefix: &str, now: DateTime<Utc>) -> Vec<Worker> {
    Stage::ALL
        .iter()
        .map(|stage| Worker::new(format!("{}{}", prefix, stage), *stage, now))
        .collect()
}

/// Build tasks for one spec, wiring per-spec stage dependencies.
pub fn build_tasks(spec_id: &str, parsed: Vec<ParsedTask>) -> Vec<Task> {
    let mut by_stage: BTreeMap<Stage, Vec<String>> = BTreeMap::new();
    let mut tasks: Vec<Task> = parsed
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let id = format!("{}-{:03}", spec_id, i + 1);
            by_stage.entry(p.stage).or_default().push(id.clone());
            Task::new(id, spec_id, p.title, p.stage).with_description(p.description)
        })
        .collect();

    for task in &mut tasks {
        let mut stage = task.stage.previous();
        while let Some(s) = stage {
            if let Some(ids) = by_stage.get(&s) {
                task.depends_on = ids.clone();
                break;
            }
            stage = s.previous();
        }
    }
    tasks
}

fn spec_name(dir: &Path, fallback: &str) -> String {
    NAME_DOCUMENTS
        .iter()
        .find_map(|doc| {
            let text = std::fs::read_to_string(dir.join(doc)).ok()?;
            parse_title(&text)
        })
        .unwrap_or_else(|| fallback.to_string())
}

/// Read every spec directory under `specs_dir`.
pub fn ingest(project_dir: &Path, specs_dir: &Path, worker_prefix: &str) -> Result<Plan> {
    if !specs_dir.is_dir() {
        bail!(
            "No specs directory at {}. Create one spec directory per feature with a {}",
            specs_dir.display(),
            TASKS_FILE
        );
    }

    let pattern = specs_dir.join("*").join(TASKS_FILE);
    let pattern = pattern.to_string_lossy();
    let mut task_files: Vec<_> = glob(&pattern)
        .context("Failed to read glob pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    task_files.sort();

    let mut plan = Plan {
        workers: default_workers(worker_prefix, Utc::now()),
        ..Default::default()
    };

    for file in task_files {
        let Some(dir) = file.parent() else { continue };
        let Some(spec_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let markdown = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let parsed = parse_tasks(&markdown);
        if parsed.is_empty() {
            warn!(spec = %spec_id, "no open tasks; skipping spec");
            continue;
        }

        let relative = dir.strip_prefix(project_dir).unwrap_or(dir);
        let spec = Spec::new(&spec_id, spec_name(dir, &spec_id))
            .with_path(relative.to_string_lossy());
        debug!(spec = %spec_id, tasks = parsed.len(), "ingested spec");
        plan.tasks.extend(build_tasks(&spec_id, parsed));
        plan.specs.push(spec);
    }

    if plan.tasks.is_empty() {
        bail!(
            "No open tasks found under {}. Add '- [ ] ...' items to a {}",
            specs_dir.display(),
            TASKS_FILE
        );
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_spec(root: &Path, id: &str, name_doc: Option<&str>, tasks: &str) {
        let dir = root.join(".foreman/specs").join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(TASKS_FILE), tasks).unwrap();
        if let Some(doc) = name_doc {
            fs::write(dir.join("srd.md"), doc).unwrap();
        }
    }

    #[test]
    fn test_build_tasks_chains_stages_within_spec() {
        let parsed = parse_tasks(
            "## Database\n- [ ] Users\n- [ ] Sessions\n## Frontend\n- [ ] Login page\n## Testing\n- [ ] Login e2e\n",
        );
        let tasks = build_tasks("auth", parsed);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["auth-001", "auth-002", "auth-003", "auth-004"]);
        assert!(tasks[0].depends_on.is_empty());
        // Backend is empty, so frontend waits on database.
        assert_eq!(tasks[2].depends_on, vec!["auth-001", "auth-002"]);
        assert_eq!(tasks[3].depends_on, vec!["auth-003"]);
    }

    #[test]
    fn test_ingest_reads_every_spec_directory() {
        let dir = tempdir().unwrap();
        write_spec(
            dir.path(),
            "auth",
            Some("# Authentication\n"),
            "## Database\n- [ ] Users\n## Backend\n- [ ] Login\n",
        );
        write_spec(dir.path(), "cart", None, "- [ ] Carts table\n");
        write_spec(dir.path(), "empty", None, "- [x] done\n");

        let plan = ingest(dir.path(), &dir.path().join(".foreman/specs"), "fm-").unwrap();
        assert_eq!(plan.specs.len(), 2);
        assert_eq!(plan.specs[0].name, "Authentication");
        assert_eq!(plan.specs[0].path.as_deref(), Some(".foreman/specs/auth"));
        assert_eq!(plan.specs[1].name, "cart");
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[1].depends_on, vec!["auth-001"]);
        assert_eq!(plan.tasks[2].id, "cart-001");
        assert_eq!(plan.workers.len(), 4);
        assert_eq!(plan.workers[0].id, "fm-database");
        assert_eq!(plan.tasks_for_stage(Stage::Database).count(), 2);
    }

    #[test]
    fn test_ingest_missing_directory() {
        let dir = tempdir().unwrap();
        let err = ingest(dir.path(), &dir.path().join("nope"), "fm-").unwrap_err();
        assert!(err.to_string().contains("No specs directory"));
    }

    #[test]
    fn test_ingest_without_open_tasks() {
        let dir = tempdir().unwrap();
        write_spec(dir.path(), "auth", None, "nothing to do\n");
        assert!(ingest(dir.path(), &dir.path().join(".foreman/specs"), "fm-").is_err());
    }

    #[test]
    fn test_plan_into_state_seeds_queues() {
        let dir = tempdir().unwrap();
        write_spec(
            dir.path(),
            "auth",
            None,
            "## Database\n- [ ] Users\n## Backend\n- [ ] Login\n",
        );
        let plan = ingest(dir.path(), &dir.path().join(".foreman/specs"), "fm-").unwrap();
        let state = plan.into_state("shop", 30, Utc::now());
        assert_eq!(state.queues[&Stage::Database], vec!["auth-001"]);
        assert!(state.queues[&Stage::Backend].is_empty());
        assert_eq!(state.stats.total_tasks, 2);
        assert_eq!(state.stats.total_specs, 1);
    }
}
