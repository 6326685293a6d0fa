//! The oracle pass over stuck tasks.
//!
//! A task that exhausts its retries is `stuck` and its worker is parked in
//! worker status `stuck`. Each tick the [`OracleDesk`] asks the [`Oracle`]
//! once per stuck episode why the task keeps failing, writes the answer to
//! `.foreman/oracle/guidance-{task}.md`, records it on the task and types it
//! into the parked worker's session. The task stays stuck: only an operator
//! revive puts it back in the queue, and the next assignment carries the
//! guidance. Every parked worker is freed by the end of the pass.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Oracle;
use super::context::OracleContext;
use super::response::OracleResponse;
use crate::errors::{StoreError, TaskError, is_fatal};
use crate::session::{SessionRunner, messages};
use crate::state::{OracleNote, StateStore, Task, TaskStatus, WorkerStatus};

#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub project_dir: PathBuf,
    pub specs_dir: PathBuf,
    /// Where guidance documents are written
    pub guidance_dir: PathBuf,
    /// When false stuck workers are freed without consulting anyone
    pub enabled: bool,
}

/// What one oracle pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OraclePassReport {
    pub advised: Vec<String>,
    /// Advised, and the oracle wants a human to look
    pub escalated: Vec<String>,
    /// Left for the next pass after a retryable collaborator failure
    pub deferred: Vec<String>,
    /// Workers freed from status `stuck`
    pub released: Vec<String>,
}

pub struct OracleDesk {
    store: StateStore,
    oracle: Arc<dyn Oracle>,
    sessions: Arc<dyn SessionRunner>,
    settings: OracleSettings,
}

fn relative_to(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

impl OracleDesk {
    pub fn new(
        store: StateStore,
        oracle: Arc<dyn Oracle>,
        sessions: Arc<dyn SessionRunner>,
        settings: OracleSettings,
    ) -> Self {
        Self {
            store,
            oracle,
            sessions,
            settings,
        }
    }

    /// Advise every stuck task that has no guidance yet, then free any
    /// worker still parked.
    pub async fn run_pass(&self) -> Result<OraclePassReport> {
        let mut report = OraclePassReport::default();
        let Some(state) = self.store.read().await? else {
            return Ok(report);
        };

        if self.settings.enabled {
            let waiting: Vec<String> = state
                .tasks_with_status(TaskStatus::Stuck)
                .filter(|t| t.oracle_guidance.is_none())
                .map(|t| t.id.clone())
                .collect();
            drop(state);
            for task_id in waiting {
                if let Err(e) = self.advise_task(&task_id, &mut report).await {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    warn!(task = %task_id, error = %e, "oracle step failed");
                }
            }
        } else {
            drop(state);
        }

        report.released.extend(self.release_parked_workers().await?);
        Ok(report)
    }

    async fn release_parked_workers(&self) -> Result<Vec<String>, StoreError> {
        self.store
            .update(|state| {
                let parked: Vec<String> = state
                    .workers
                    .values()
                    .filter(|w| w.status == WorkerStatus::Stuck)
                    .filter_map(|w| w.current_task.clone())
                    .collect();
                let now = Utc::now();
                let released: Vec<String> = parked
                    .iter()
                    .filter_map(|task_id| state.release_stuck_worker(task_id, now))
                    .collect();
                Ok::<_, StoreError>(released)
            })
            .await
    }

    async fn advise_task(&self, task_id: &str, report: &mut OraclePassReport) -> Result<()> {
        let state = self.store.load().await?;
        let ctx = OracleContext::gather(
            &state,
            task_id,
            &self.settings.project_dir,
            &self.settings.specs_dir,
        )?;
        if ctx.task.status != TaskStatus::Stuck || ctx.task.oracle_guidance.is_some() {
            return Ok(());
        }
        let session = ctx
            .worker
            .as_deref()
            .and_then(|id| state.workers.get(id))
            .map(|w| w.session.clone());
        drop(state);

        info!(task = %task_id, "consulting oracle");
        let advice = match self.oracle.advise(&ctx).await {
            Ok(advice) => advice,
            Err(e) if e.is_retryable() => {
                warn!(task = %task_id, error = %e, "oracle deferred");
                report.deferred.push(task_id.to_string());
                return Ok(());
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "oracle gave no usable advice");
                OracleResponse {
                    analysis: format!("Oracle could not advise: {}", e),
                    guidance: String::new(),
                    escalate: true,
                }
            }
        };

        let path = if advice.guidance.is_empty() {
            None
        } else {
            match self.write_guidance(&ctx.task, &advice) {
                Ok(path) => Some(relative_to(&path, &self.settings.project_dir)),
                Err(e) => {
                    warn!(task = %task_id, error = %e, "could not write guidance file");
                    None
                }
            }
        };
        let note = OracleNote {
            provided_at: Utc::now(),
            analysis: advice.analysis,
            guidance: advice.guidance,
            escalate: advice.escalate,
            path,
        };

        let recorded = note.clone();
        self.store
            .update(|state| -> Result<_, TaskError> {
                state.record_oracle_guidance(task_id, recorded, Utc::now())
            })
            .await?;
        report.advised.push(task_id.to_string());
        if note.escalate {
            warn!(task = %task_id, "oracle says a human is needed");
            report.escalated.push(task_id.to_string());
        } else {
            info!(task = %task_id, path = ?note.path, "oracle guidance recorded");
        }

        match session {
            Some(session) if !note.guidance.is_empty() => {
                let message = messages::oracle_guidance_message(&ctx.task, &note);
                if let Err(e) = self.sessions.send(&session, &message).await {
                    warn!(task = %task_id, session = %session, error = %e, "could not deliver guidance");
                }
            }
            _ => debug!(task = %task_id, "no worker to hand guidance to"),
        }
        Ok(())
    }

    fn write_guidance(&self, task: &Task, advice: &OracleResponse) -> Result<PathBuf> {
        let dir = &self.settings.guidance_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create oracle directory {}", dir.display()))?;
        let path = dir.join(format!("guidance-{}.md", task.id));
        let document = format!(
            "# Oracle guidance for {id}\n\n\
             **Task:** {title}\n\
             **Stuck because:** {reason}\n\
             **Escalate to a human:** {escalate}\n\
             **Generated:** {at}\n\n\
             ## Analysis\n\n{analysis}\n\n\
             ## Suggested fix\n\n{guidance}\n",
            id = task.id,
            title = task.title,
            reason = task.stuck_reason.as_deref().unwrap_or("unknown"),
            escalate = if advice.escalate { "yes" } else { "no" },
            at = Utc::now().to_rfc3339(),
            analysis = advice.analysis.trim(),
            guidance = advice.guidance.trim(),
        );
        std::fs::write(&path, document)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
