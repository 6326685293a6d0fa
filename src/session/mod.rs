//! Worker execution sessions.
//!
//! The coordinator never runs agents itself. It talks to each worker's
//! isolated session through a [`SessionRunner`]: start it, stop it, ask
//! whether it is still alive and type text into it. [`TmuxRunner`] backs
//! sessions with detached tmux sessions named after the worker.

pub mod messages;
pub mod tmux;

use async_trait::async_trait;

use crate::errors::CollaboratorError;

pub use tmux::TmuxRunner;

/// Abstraction over worker sessions for testability.
/// Real implementation: `TmuxRunner`.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// Create the session and launch the worker's agent in it.
    async fn start(&self, session: &str) -> Result<(), CollaboratorError>;

    /// Tear the session down. Stopping a session that is not running succeeds.
    async fn stop(&self, session: &str) -> Result<(), CollaboratorError>;

    async fn is_alive(&self, session: &str) -> Result<bool, CollaboratorError>;

    /// Type `text` into the session and submit it.
    async fn send(&self, session: &str, text: &str) -> Result<(), CollaboratorError>;
}
