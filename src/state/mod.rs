//! Pipeline state: the persisted document, its store, the ready queues and
//! the task lifecycle transitions applied through the store.

pub mod lifecycle;
pub mod model;
pub mod queue;
pub mod store;

pub use lifecycle::{FailureOutcome, RejectionOutcome, Resolution, TaskPolicy};
pub use model::{
    Activity, ActivityKind, EscalationDecision, Intervention, OrchestratorInfo,
    OracleNote, OrchestratorStatus, PipelineState, RunStatus, Spec, SpecStatus, Stage, StageProgress, Stats,
    Task, TaskStatus, Worker, WorkerStatus,
};
pub use queue::{dependencies_satisfied, refresh_queues, unmet_dependencies};
pub use store::{StateStore, StoreSettings};
