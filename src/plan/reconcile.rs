//! Pre-flight reconciliation: before the first run, ask a collaborator which
//! pending tasks the project already implements and mark those merged.
//!
//! The reconciler sees an inventory of project files, the spec documents and
//! the pending tasks. Its answer is applied through
//! [`PipelineState::mark_implemented`], so dependency order still holds: a
//! claimed task whose dependencies are not done (or claimed) stays pending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{CollaboratorError, TaskError};
use crate::review::ClaudeCli;
use crate::review::context::{SKIPPED_DIRS, first_spec_document, spec_dir};
use crate::state::{PipelineState, Task, TaskStatus};
use crate::util::extract_json;

const RECONCILER: &str = "reconciler";

/// Project files listed in a reconcile prompt.
pub const INVENTORY_LIMIT: usize = 500;
/// Characters of each spec document included in a reconcile prompt.
pub const SPEC_EXCERPT_LIMIT: usize = 3_000;

/// One spec document excerpt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecExcerpt {
    pub id: String,
    pub name: String,
    pub text: Option<String>,
}

/// Everything the reconciler sees.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// Project-relative paths, sorted
    pub files: Vec<String>,
    pub specs: Vec<SpecExcerpt>,
    pub pending: Vec<Task>,
}

impl ReconcileContext {
    pub fn gather(state: &PipelineState, project_dir: &Path, specs_dir: &Path) -> Self {
        let specs = state
            .specs
            .values()
            .map(|spec| SpecExcerpt {
                id: spec.id.clone(),
                name: spec.name.clone(),
                text: first_spec_document(
                    &spec_dir(state, &spec.id, project_dir, specs_dir),
                    SPEC_EXCERPT_LIMIT,
                ),
            })
            .collect();
        let pending = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        Self {
            files: inventory(project_dir),
            specs,
            pending,
        }
    }
}

/// Project files, skipping hidden entries and build output.
pub fn inventory(project_dir: &Path) -> Vec<String> {
    let walker = WalkDir::new(project_dir).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        let skipped = name.starts_with('.') || SKIPPED_DIRS.contains(&&*name);
        entry.depth() == 0 || !skipped
    });
    let mut files: Vec<String> = walker
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(project_dir).ok()?;
            Some(rel.to_string_lossy().into_owned())
        })
        .collect();
    files.sort();
    if files.len() > INVENTORY_LIMIT {
        debug!(found = files.len(), kept = INVENTORY_LIMIT, "inventory truncated");
        files.truncate(INVENTORY_LIMIT);
    }
    files
}

/// The reconciler's verdict on one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssessment {
    pub id: String,
    pub implemented: bool,
    /// Files or facts showing the task is done
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReconcileResponse {
    tasks: Vec<TaskAssessment>,
}

pub fn parse_reconcile_response(text: &str) -> Result<Vec<TaskAssessment>, CollaboratorError> {
    let json = extract_json(text).ok_or_else(|| CollaboratorError::Parse {
        collaborator: RECONCILER,
        message: "no JSON object in response".to_string(),
    })?;
    let response: ReconcileResponse =
        serde_json::from_str(json).map_err(|e| CollaboratorError::Parse {
            collaborator: RECONCILER,
            message: e.to_string(),
        })?;
    Ok(response.tasks)
}

pub fn build_reconcile_prompt(ctx: &ReconcileContext) -> String {
    let mut prompt = String::from(
        "You are checking which planned tasks an existing codebase already implements.\n\n\
         ## Existing Files\n",
    );
    if ctx.files.is_empty() {
        prompt.push_str("(none)\n");
    }
    for file in &ctx.files {
        prompt.push_str(&format!("- {}\n", file));
    }

    prompt.push_str("\n## Specs\n");
    for spec in &ctx.specs {
        prompt.push_str(&format!("\n### {} ({})\n", spec.name, spec.id));
        prompt.push_str(spec.text.as_deref().unwrap_or("(no spec document)"));
        prompt.push('\n');
    }

    prompt.push_str("\n## Pending Tasks\n");
    for task in &ctx.pending {
        prompt.push_str(&format!("- {} [{}] {}\n", task.id, task.stage, task.title));
    }

    prompt.push_str(
        "\nFor each pending task decide whether the files above already implement it. \
         Be conservative: only mark a task implemented when the evidence is clear.\n\n\
         Respond with JSON only:\n\
         {\"tasks\": [{\"id\": \"<task id>\", \"implemented\": true, \
         \"evidence\": \"<files that implement it>\"}]}\n",
    );
    prompt
}

/// Decides which pending tasks are already done.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn assess(
        &self,
        ctx: &ReconcileContext,
    ) -> Result<Vec<TaskAssessment>, CollaboratorError>;
}

pub struct ClaudeReconciler {
    cli: ClaudeCli,
}

impl ClaudeReconciler {
    pub fn new(cli: ClaudeCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Reconciler for ClaudeReconciler {
    async fn assess(
        &self,
        ctx: &ReconcileContext,
    ) -> Result<Vec<TaskAssessment>, CollaboratorError> {
        let prompt = build_reconcile_prompt(ctx);
        let output = self.cli.exchange(RECONCILER, &prompt).await?;
        parse_reconcile_response(&output)
    }
}

/// What a reconcile pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Marked merged, in the order they were applied
    pub marked: Vec<String>,
    /// Claimed implemented but left pending on unmet dependencies
    pub blocked: Vec<String>,
    /// Claimed ids that are not pending tasks of this plan
    pub unknown: Vec<String>,
}

/// Apply `assessments` to `state`. Claimed tasks are marked in dependency
/// order until no more can be marked.
pub fn apply_assessments(
    state: &mut PipelineState,
    assessments: &[TaskAssessment],
    now: DateTime<Utc>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut claimed: Vec<&TaskAssessment> = Vec::new();
    let mut seen = BTreeSet::new();
    for assessment in assessments.iter().filter(|a| a.implemented) {
        if !seen.insert(assessment.id.as_str()) {
            continue;
        }
        match state.tasks.get(&assessment.id) {
            Some(task) if task.status == TaskStatus::Pending => claimed.push(assessment),
            _ => report.unknown.push(assessment.id.clone()),
        }
    }

    loop {
        let mut progressed = false;
        let mut waiting = Vec::new();
        for assessment in claimed {
            let evidence = assessment
                .evidence
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or("reported implemented");
            match state.mark_implemented(&assessment.id, evidence, now) {
                Ok(()) => {
                    debug!(task = %assessment.id, evidence, "task already implemented");
                    report.marked.push(assessment.id.clone());
                    progressed = true;
                }
                Err(TaskError::DependencyViolation { .. }) => waiting.push(assessment),
                Err(e) => {
                    warn!(task = %assessment.id, error = %e, "could not reconcile task");
                    report.unknown.push(assessment.id.clone());
                }
            }
        }
        claimed = waiting;
        if !progressed || claimed.is_empty() {
            break;
        }
    }
    report.blocked = claimed.into_iter().map(|a| a.id.clone()).collect();
    report
}

/// Ask `reconciler` about every pending task and mark the implemented ones.
/// Nothing is asked when no task is pending.
pub async fn reconcile(
    state: &mut PipelineState,
    reconciler: &dyn Reconciler,
    project_dir: &Path,
    specs_dir: &Path,
) -> Result<ReconcileReport, CollaboratorError> {
    let ctx = ReconcileContext::gather(state, project_dir, specs_dir);
    if ctx.pending.is_empty() {
        return Ok(ReconcileReport::default());
    }
    let assessments = reconciler.assess(&ctx).await?;
    let report = apply_assessments(state, &assessments, Utc::now());
    info!(
        marked = report.marked.len(),
        blocked = report.blocked.len(),
        unknown = report.unknown.len(),
        "reconciled plan against project"
    );
    Ok(report)
}
