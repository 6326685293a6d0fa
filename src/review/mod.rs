//! Review and escalation for completed tasks.
//!
//! A task the worker reports as done sits in `completed` until the
//! [`EscalationMachine`] reviews its branch diff. Approval merges the branch;
//! rejection sends the issues back to the worker. After the configured number
//! of rejections the task is `escalated` and the strategist picks exactly one
//! of four outcomes.
//!
//! ## Components
//!
//! - [`Reviewer`]: approve/reject verdict for a diff
//! - [`Strategist`]: decision for a task whose reviews are exhausted
//! - [`Oracle`]: advice for a task whose retries are exhausted
//! - [`claude`]: the collaborators backed by the `claude` CLI
//! - [`response`]: strict response schemas for the CLI output
//! - [`escalation`]: the state machine driving reviews each tick
//! - [`oracle`]: the per-tick pass over stuck tasks
//!
//! ## Example
//!
//! ```
//! use foreman::review::parse_review_response;
//!
//! let verdict = parse_review_response(r#"{"approved": false, "issues": ["missing null check"]}"#)
//!     .unwrap();
//! assert!(!verdict.approved);
//! assert_eq!(verdict.issues, vec!["missing null check"]);
//! ```

pub mod claude;
pub mod context;
pub mod escalation;
pub mod oracle;
pub mod prompts;
pub mod response;

use async_trait::async_trait;

use crate::errors::CollaboratorError;
use crate::state::Resolution;

pub use claude::{ClaudeCli, ClaudeOracle, ClaudeReviewer, ClaudeStrategist};
pub use context::{OracleContext, ReviewContext, StrategistContext};
pub use escalation::{EscalationMachine, EscalationSettings, ReviewPassReport};
pub use oracle::{OracleDesk, OraclePassReport, OracleSettings};
pub use response::{
    OracleResponse, ReviewResponse, StrategistAction, StrategistResponse, parse_oracle_response,
    parse_review_response, parse_strategist_response,
};

/// Abstraction over code review for testability.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Judge `diff` for the task in `ctx`. A response that does not match the
    /// schema is a [`CollaboratorError::Parse`], never an approval.
    async fn review(
        &self,
        ctx: &ReviewContext,
        diff: &str,
    ) -> Result<ReviewResponse, CollaboratorError>;
}

/// Abstraction over escalation decisions for testability.
#[async_trait]
pub trait Strategist: Send + Sync {
    async fn decide(&self, ctx: &StrategistContext) -> Result<Resolution, CollaboratorError>;
}

/// Abstraction over stuck-task advice for testability.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn advise(&self, ctx: &OracleContext) -> Result<OracleResponse, CollaboratorError>;
}
