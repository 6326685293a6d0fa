use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::foreman_config::ForemanToml;
use crate::state::{StateStore, StoreSettings, TaskPolicy};

/// Runtime configuration for foreman.
///
/// Resolves the `.foreman/` layout under the project directory and merges
/// settings from `foreman.toml`, then environment variables, then CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub state_file: PathBuf,
    pub specs_dir: PathBuf,
    pub issues_dir: PathBuf,
    /// Oracle guidance documents
    pub oracle_dir: PathBuf,
    pub log_dir: PathBuf,
    pub project_name: String,
    pub verbose: bool,
    /// The underlying file configuration, with overrides applied
    pub toml: ForemanToml,
}

impl Config {
    /// Load configuration for a project directory (file → env).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foreman_dir = project_dir.join(".foreman");
        let mut toml = ForemanToml::load_or_default(&foreman_dir)?;
        apply_env_overrides(&mut toml);

        let project_name = toml.project.name.clone().unwrap_or_else(|| {
            project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        });

        Ok(Self {
            state_file: foreman_dir.join("state.json"),
            specs_dir: foreman_dir.join("specs"),
            issues_dir: foreman_dir.join("issues"),
            oracle_dir: foreman_dir.join("oracle"),
            log_dir: foreman_dir.join("logs"),
            foreman_dir,
            project_dir,
            project_name,
            verbose: false,
            toml,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// CLI override for the poll interval.
    pub fn with_poll_interval(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.toml.orchestrator.poll_interval_secs = secs;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.toml.orchestrator.poll_interval_secs.max(1))
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.orchestrator.worker_timeout_secs)
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.review.timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.sessions.command_timeout_secs)
    }

    pub fn claude_cmd(&self) -> String {
        self.toml.claude_cmd()
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            lock_retries: self.toml.store.lock_retries,
            min_backoff: Duration::from_millis(self.toml.store.lock_min_backoff_ms),
            max_backoff: Duration::from_millis(self.toml.store.lock_max_backoff_ms),
            activity_limit: self.toml.store.activity_limit,
        }
    }

    /// Store handle for this project's state document.
    pub fn store(&self) -> StateStore {
        StateStore::new(self.state_file.clone()).with_settings(self.store_settings())
    }

    pub fn task_policy(&self) -> TaskPolicy {
        TaskPolicy {
            max_retries: self.toml.orchestrator.max_retries,
            max_review_attempts: self.toml.review.max_attempts,
            review_enabled: self.toml.review.enabled,
            branch_prefix: self.toml.project.branch_prefix.clone(),
        }
    }

    /// Create the `.foreman/` directory tree.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.foreman_dir,
            &self.specs_dir,
            &self.issues_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn apply_env_overrides(toml: &mut ForemanToml) {
    if let Some(v) = env_number("FOREMAN_POLL_INTERVAL") {
        toml.orchestrator.poll_interval_secs = v;
    }
    if let Some(v) = env_number("FOREMAN_WORKER_TIMEOUT") {
        toml.orchestrator.worker_timeout_secs = v;
    }
    if let Some(v) = env_number("FOREMAN_MAX_RETRIES") {
        toml.orchestrator.max_retries = v as u32;
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric environment override");
            None
        }
    }
}
