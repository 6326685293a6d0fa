use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::SessionRunner;
use crate::config::Config;
use crate::errors::CollaboratorError;

const COLLABORATOR: &str = "session runner";

/// Default time allowed for a single tmux invocation.
pub const DEFAULT_TMUX_TIMEOUT_SECS: u64 = 10;

/// Sessions backed by detached tmux sessions.
#[derive(Debug, Clone)]
pub struct TmuxRunner {
    project_dir: PathBuf,
    agent_cmd: Option<String>,
    tmux_cmd: String,
    timeout: Duration,
}

impl TmuxRunner {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            agent_cmd: None,
            tmux_cmd: "tmux".to_string(),
            timeout: Duration::from_secs(DEFAULT_TMUX_TIMEOUT_SECS),
        }
    }

    /// Runner configured from `[sessions]` in foreman.toml.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.project_dir)
            .with_agent_cmd(config.toml.sessions.agent_cmd.clone())
            .with_timeout(config.session_timeout())
    }

    /// Command typed into a freshly started session.
    pub fn with_agent_cmd(mut self, cmd: impl Into<String>) -> Self {
        let cmd = cmd.into();
        self.agent_cmd = (!cmd.trim().is_empty()).then_some(cmd);
        self
    }

    pub fn with_tmux_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.tmux_cmd = cmd.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn tmux(&self, args: &[&str]) -> Result<Output, CollaboratorError> {
        debug!(cmd = %self.tmux_cmd, ?args, "tmux");
        let output = Command::new(&self.tmux_cmd)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CollaboratorError::Transport {
                collaborator: COLLABORATOR,
                message: format!("failed to run {}: {}", self.tmux_cmd, e),
            }),
            Err(_) => Err(CollaboratorError::Timeout {
                collaborator: COLLABORATOR,
                after: self.timeout,
            }),
        }
    }

    async fn tmux_ok(&self, args: &[&str]) -> Result<(), CollaboratorError> {
        let output = self.tmux(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CollaboratorError::Transport {
                collaborator: COLLABORATOR,
                message: format!(
                    "tmux {} failed: {}",
                    args.first().copied().unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

/// Exact-match target so `fm-db` never resolves to `fm-db-2`.
fn target(session: &str) -> String {
    format!("={}", session)
}

/// Active pane of the session's current window.
fn pane_target(session: &str) -> String {
    format!("={}:", session)
}

#[async_trait]
impl SessionRunner for TmuxRunner {
    async fn start(&self, session: &str) -> Result<(), CollaboratorError> {
        let dir = self.project_dir.to_string_lossy().into_owned();
        self.tmux_ok(&["new-session", "-d", "-s", session, "-c", dir.as_str()])
            .await?;
        if let Some(cmd) = &self.agent_cmd {
            self.send(session, cmd).await?;
        }
        Ok(())
    }

    async fn stop(&self, session: &str) -> Result<(), CollaboratorError> {
        let t = target(session);
        let output = self.tmux(&["kill-session", "-t", t.as_str()]).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success()
            || stderr.contains("can't find session")
            || stderr.contains("no server running")
        {
            Ok(())
        } else {
            Err(CollaboratorError::Transport {
                collaborator: COLLABORATOR,
                message: format!("tmux kill-session failed: {}", stderr.trim()),
            })
        }
    }

    async fn is_alive(&self, session: &str) -> Result<bool, CollaboratorError> {
        let t = target(session);
        let output = self.tmux(&["has-session", "-t", t.as_str()]).await?;
        Ok(output.status.success())
    }

    async fn send(&self, session: &str, text: &str) -> Result<(), CollaboratorError> {
        let t = pane_target(session);
        let typed = self.tmux(&["send-keys", "-t", t.as_str(), "-l", text]).await?;
        if !typed.status.success() {
            return Err(CollaboratorError::SessionDead {
                session: session.to_string(),
            });
        }
        self.tmux_ok(&["send-keys", "-t", t.as_str(), "Enter"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_target_is_exact_match() {
        assert_eq!(target("fm-database"), "=fm-database");
        assert_eq!(pane_target("fm-database"), "=fm-database:");
    }

    #[test]
    fn test_blank_agent_cmd_is_ignored() {
        let runner = TmuxRunner::new("/tmp").with_agent_cmd("  ");
        assert!(runner.agent_cmd.is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_failure() {
        let dir = tempdir().unwrap();
        let runner = TmuxRunner::new(dir.path()).with_tmux_cmd("definitely-not-tmux-xyz");
        let err = runner.is_alive("fm-database").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, CollaboratorError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_exit_status_drives_liveness() {
        let dir = tempdir().unwrap();
        let alive = TmuxRunner::new(dir.path()).with_tmux_cmd("true");
        assert!(alive.is_alive("fm-database").await.unwrap());
        alive.start("fm-database").await.unwrap();
        alive.send("fm-database", "hello").await.unwrap();

        let dead = TmuxRunner::new(dir.path()).with_tmux_cmd("false");
        assert!(!dead.is_alive("fm-database").await.unwrap());
        assert!(matches!(
            dead.send("fm-database", "hello").await,
            Err(CollaboratorError::SessionDead { .. })
        ));
        assert!(dead.start("fm-database").await.is_err());
    }
}
