//! Configuration file for foreman.
//!
//! Settings live in `.foreman/foreman.toml`. Every field has a default, so an
//! absent file or an empty section behaves exactly like the defaults below.
//! Environment and CLI overrides are layered on top by [`crate::config::Config`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-app"
//! main_branch = "main"
//! branch_prefix = "foreman/"
//!
//! [orchestrator]
//! poll_interval_secs = 30
//! worker_timeout_secs = 600
//! max_retries = 3
//!
//! [review]
//! enabled = true
//! max_attempts = 3
//! claude_cmd = "claude"
//! timeout_secs = 300
//! diff_limit = 50000
//! auto_push = false
//!
//! [oracle]
//! enabled = true
//!
//! [store]
//! lock_retries = 5
//! lock_min_backoff_ms = 100
//! lock_max_backoff_ms = 1000
//! activity_limit = 100
//!
//! [sessions]
//! prefix = "fm-"
//! command_timeout_secs = 10
//! agent_cmd = "claude"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (defaults to the directory name)
    #[serde(default)]
    pub name: Option<String>,
    /// Integration branch that approved work is merged into
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    /// Prefix for per-task worker branches
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "foreman/".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            main_branch: default_main_branch(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

/// Poll loop timing and retry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Inactivity before a busy worker is nudged
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
    /// Failures before a task is marked stuck
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_worker_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            worker_timeout_secs: default_worker_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Review and escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub claude_cmd: Option<String>,
    #[serde(default = "default_review_timeout")]
    pub timeout_secs: u64,
    /// Diff characters sent to the reviewer
    #[serde(default = "default_diff_limit")]
    pub diff_limit: usize,
    /// Push main to origin after each merge
    #[serde(default)]
    pub auto_push: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_review_timeout() -> u64 {
    300
}

fn default_diff_limit() -> usize {
    50_000
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            claude_cmd: None,
            timeout_secs: default_review_timeout(),
            diff_limit: default_diff_limit(),
            auto_push: false,
        }
    }
}

/// Advice for stuck tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSection {
    /// Consult the oracle once per stuck episode
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// State store locking and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_min_backoff")]
    pub lock_min_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub lock_max_backoff_ms: u64,
    #[serde(default = "default_activity_limit")]
    pub activity_limit: usize,
}

fn default_lock_retries() -> u32 {
    5
}

fn default_min_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    1000
}

fn default_activity_limit() -> usize {
    100
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            lock_retries: default_lock_retries(),
            lock_min_backoff_ms: default_min_backoff(),
            lock_max_backoff_ms: default_max_backoff(),
            activity_limit: default_activity_limit(),
        }
    }
}

/// Worker session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsSection {
    /// Worker/session id prefix, e.g. `fm-` gives `fm-database`
    #[serde(default = "default_session_prefix")]
    pub prefix: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Agent command launched in a fresh session
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
}

fn default_session_prefix() -> String {
    "fm-".to_string()
}

fn default_command_timeout() -> u64 {
    10
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            prefix: default_session_prefix(),
            command_timeout_secs: default_command_timeout(),
            agent_cmd: default_agent_cmd(),
        }
    }
}

/// Root of `foreman.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

impl ForemanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `.foreman/foreman.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reviewer command, with fallback to `CLAUDE_CMD`.
    pub fn claude_cmd(&self) -> String {
        self.review
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.poll_interval_secs == 0 {
            warnings.push("orchestrator.poll_interval_secs must be greater than 0".to_string());
        }
        if self.orchestrator.worker_timeout_secs == 0 {
            warnings.push("orchestrator.worker_timeout_secs must be greater than 0".to_string());
        }
        if self.orchestrator.max_retries == 0 {
            warnings.push(
                "orchestrator.max_retries is 0: every failure marks the task stuck".to_string(),
            );
        }
        if self.review.max_attempts == 0 {
            warnings.push(
                "review.max_attempts is 0: every rejection escalates immediately".to_string(),
            );
        }
        if self.store.lock_min_backoff_ms > self.store.lock_max_backoff_ms {
            warnings.push(format!(
                "store.lock_min_backoff_ms ({}) exceeds lock_max_backoff_ms ({})",
                self.store.lock_min_backoff_ms, self.store.lock_max_backoff_ms
            ));
        }
        if self.project.branch_prefix.is_empty() {
            warnings.push(
                "project.branch_prefix is empty: task branches will be bare task ids".to_string(),
            );
        }
        if self.sessions.prefix.is_empty() {
            warnings.push("sessions.prefix is empty: worker ids are bare stage names".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = ForemanToml::parse("").unwrap();
        assert_eq!(cfg.orchestrator.poll_interval_secs, 30);
        assert_eq!(cfg.orchestrator.worker_timeout_secs, 600);
        assert_eq!(cfg.orchestrator.max_retries, 3);
        assert!(cfg.review.enabled);
        assert_eq!(cfg.review.max_attempts, 3);
        assert_eq!(cfg.review.diff_limit, 50_000);
        assert!(cfg.oracle.enabled);
        assert_eq!(cfg.store.lock_retries, 5);
        assert_eq!(cfg.store.activity_limit, 100);
        assert_eq!(cfg.project.main_branch, "main");
        assert_eq!(cfg.sessions.prefix, "fm-");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = ForemanToml::parse(
            r#"
            [orchestrator]
            poll_interval_secs = 5

            [review]
            enabled = false

            [oracle]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(!cfg.oracle.enabled);
        assert_eq!(cfg.orchestrator.poll_interval_secs, 5);
        assert_eq!(cfg.orchestrator.max_retries, 3);
        assert!(!cfg.review.enabled);
        assert_eq!(cfg.review.timeout_secs, 300);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = ForemanToml::parse("[orchestrator\npoll = ").unwrap_err();
        assert!(err.to_string().contains("foreman.toml"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut cfg = ForemanToml::default();
        cfg.orchestrator.poll_interval_secs = 0;
        cfg.store.lock_min_backoff_ms = 5000;
        cfg.project.branch_prefix.clear();
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("poll_interval_secs"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut cfg = ForemanToml::default();
        cfg.project.name = Some("shop".into());
        cfg.review.max_attempts = 5;
        let path = dir.path().join("foreman.toml");
        cfg.save(&path).unwrap();

        let loaded = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.project.name.as_deref(), Some("shop"));
        assert_eq!(loaded.review.max_attempts, 5);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let cfg = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.orchestrator.poll_interval_secs, 30);
    }

    #[test]
    fn test_claude_cmd_prefers_file_then_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("CLAUDE_CMD").ok();

        // SAFETY: serialized by ENV_MUTEX
        unsafe { std::env::set_var("CLAUDE_CMD", "claude-env") };
        let mut cfg = ForemanToml::default();
        assert_eq!(cfg.claude_cmd(), "claude-env");
        cfg.review.claude_cmd = Some("claude-file".into());
        assert_eq!(cfg.claude_cmd(), "claude-file");

        match saved {
            Some(v) => unsafe { std::env::set_var("CLAUDE_CMD", v) },
            None => unsafe { std::env::remove_var("CLAUDE_CMD") },
        }
    }
}
