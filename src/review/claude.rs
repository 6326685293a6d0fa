//! Reviewer, strategist and oracle backed by the `claude` CLI in print mode.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::context::{OracleContext, ReviewContext, StrategistContext};
use super::prompts::{build_oracle_prompt, build_review_prompt, build_strategist_prompt};
use super::response::{
    OracleResponse, ReviewResponse, parse_oracle_response, parse_review_response,
    parse_strategist_response,
};
use super::{Oracle, Reviewer, Strategist};
use crate::errors::CollaboratorError;
use crate::state::Resolution;
use crate::util::truncate_chars;

/// Default time allowed for one collaborator call.
pub const DEFAULT_CLAUDE_TIMEOUT_SECS: u64 = 300;

/// One-shot `claude --print` invocations with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    cmd: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ClaudeCli {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            working_dir: None,
            timeout: Duration::from_secs(DEFAULT_CLAUDE_TIMEOUT_SECS),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) async fn exchange(
        &self,
        collaborator: &'static str,
        prompt: &str,
    ) -> Result<String, CollaboratorError> {
        let transport = |message: String| CollaboratorError::Transport {
            collaborator,
            message,
        };

        let mut cmd = Command::new(&self.cmd);
        cmd.arg("--print");
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| transport(format!("failed to spawn {}: {}", self.cmd, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| transport(format!("failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| transport(format!("failed to close stdin: {}", e)))?;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| transport("stderr not captured".to_string()))?;

        let run = async {
            let mut out = String::new();
            let mut err = String::new();
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
            read_out?;
            read_err?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, output, errors) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| CollaboratorError::Timeout {
                collaborator,
                after: self.timeout,
            })?
            .map_err(|e| transport(format!("failed to read output: {}", e)))?;

        debug!(collaborator, chars = output.len(), "claude responded");
        if !status.success() {
            return Err(transport(format!(
                "{} exited with code {}: {}",
                self.cmd,
                status.code().unwrap_or(-1),
                truncate_chars(errors.trim(), 500, "…")
            )));
        }
        Ok(output)
    }
}

pub struct ClaudeReviewer {
    cli: ClaudeCli,
    diff_limit: usize,
}

impl ClaudeReviewer {
    pub fn new(cli: ClaudeCli, diff_limit: usize) -> Self {
        Self { cli, diff_limit }
    }
}

#[async_trait]
impl Reviewer for ClaudeReviewer {
    async fn review(
        &self,
        ctx: &ReviewContext,
        diff: &str,
    ) -> Result<ReviewResponse, CollaboratorError> {
        let diff = truncate_chars(diff, self.diff_limit, "\n[diff truncated]");
        let prompt = build_review_prompt(ctx, &diff);
        let output = self.cli.exchange("reviewer", &prompt).await?;
        parse_review_response(&output)
    }
}

pub struct ClaudeStrategist {
    cli: ClaudeCli,
}

impl ClaudeStrategist {
    pub fn new(cli: ClaudeCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Strategist for ClaudeStrategist {
    async fn decide(&self, ctx: &StrategistContext) -> Result<Resolution, CollaboratorError> {
        let prompt = build_strategist_prompt(ctx);
        let output = self.cli.exchange("strategist", &prompt).await?;
        Ok(parse_strategist_response(&output)?.into_resolution())
    }
}

pub struct ClaudeOracle {
    cli: ClaudeCli,
}

impl ClaudeOracle {
    pub fn new(cli: ClaudeCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Oracle for ClaudeOracle {
    async fn advise(&self, ctx: &OracleContext) -> Result<OracleResponse, CollaboratorError> {
        let prompt = build_oracle_prompt(ctx);
        let output = self.cli.exchange("oracle", &prompt).await?;
        parse_oracle_response(&output)
    }
}
