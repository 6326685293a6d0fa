//! Typed error hierarchy for the foreman coordinator.
//!
//! Three top-level enums cover the three seams:
//! - `StoreError`: state document persistence and locking
//! - `TaskError`: task/worker lifecycle transitions applied to the state
//! - `CollaboratorError`: calls into session runners, reviewers and strategists

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::{TaskStatus, WorkerStatus};

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Could not lock state at {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("No state found at {path}. Run 'foreman init' first.")]
    NotInitialized { path: PathBuf },

    #[error("State already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("State file {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    /// A corrupt document leaves no trustworthy source of truth, so nothing can proceed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Errors from task and worker transitions.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {task} has unmet dependencies: {}", unmet.join(", "))]
    DependencyViolation { task: String, unmet: Vec<String> },

    #[error("Task {0} not found")]
    UnknownTask(String),

    #[error("Worker {0} not found")]
    UnknownWorker(String),

    #[error("Cannot {action} task {task} while it is {status}")]
    InvalidTransition {
        task: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Worker {worker} is {status}, not idle")]
    WorkerUnavailable { worker: String, status: WorkerStatus },

    #[error("Task {task} belongs to stage {task_stage}, worker {worker} serves {worker_stage}")]
    StageMismatch {
        task: String,
        task_stage: String,
        worker: String,
        worker_stage: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Store(e) if e.is_fatal())
    }
}

/// Errors from external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{collaborator} transport failure: {message}")]
    Transport {
        collaborator: &'static str,
        message: String,
    },

    #[error("{collaborator} did not respond within {}s", after.as_secs())]
    Timeout {
        collaborator: &'static str,
        after: Duration,
    },

    #[error("{collaborator} returned an unparseable response: {message}")]
    Parse {
        collaborator: &'static str,
        message: String,
    },

    #[error("Session {session} is not running")]
    SessionDead { session: String },
}

impl CollaboratorError {
    /// Transport-level failures are deferred to the next cycle without touching state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Transport { .. } | CollaboratorError::Timeout { .. }
        )
    }
}

/// Returns true when an error chain carries a fatal store error.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_fatal)
            || cause.downcast_ref::<TaskError>().is_some_and(TaskError::is_fatal)
    })
}
