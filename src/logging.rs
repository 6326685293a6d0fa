//! Tracing subscriber setup.
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! Long-running commands also get a daily rolling file under `.foreman/logs/`.
//! `RUST_LOG` refines the filter; `FOREMAN_LOG_FORMAT=json` switches every
//! layer to JSON lines.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    /// Directory for the rolling log file; console only when `None`
    pub log_dir: Option<PathBuf>,
}

impl LogOptions {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            json: std::env::var("FOREMAN_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let directive = if options.verbose {
        "foreman=debug"
    } else {
        "foreman=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let (file_writer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if options.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
            .try_init()
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
