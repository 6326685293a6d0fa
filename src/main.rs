use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use foreman::config::Config;
use foreman::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Coordinates staged AI workers from spec to merged code")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest .foreman/specs and create the pipeline state
    Init {
        /// Replace an existing state document
        #[arg(long)]
        force: bool,
        /// Print the plan without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Mark tasks the project already implements as merged
        #[arg(long)]
        reconcile: bool,
    },
    /// Run the poll loop
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
        /// Seconds between ticks. Overrides foreman.toml
        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Show pipeline progress, queues and workers
    Status,
    /// List stuck tasks and tasks waiting on a human
    Stuck,
    /// Stop assigning and reviewing until resumed
    Pause,
    /// Resume a paused pipeline
    Resume,
    /// Ask a running orchestrator to exit after its current tick
    Stop,
    /// Worker self-report for a task
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Reset a stuck task so it is scheduled again
    Revive { task: String },
    /// Manage worker sessions
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Serve the state document over HTTP (read-only)
    Serve {
        #[arg(short, long, default_value_t = foreman::server::DEFAULT_PORT)]
        port: u16,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Delete the state document
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ReportCommands {
    /// The worker picked the task up
    Start { task: String },
    /// The worker is running its own checks
    Verify { task: String },
    /// The work is committed on the task branch
    Complete {
        task: String,
        /// Files touched by the change (comma-separated or repeated)
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },
    /// The worker could not finish the task
    Fail {
        task: String,
        #[arg(long, default_value = "unspecified failure")]
        reason: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum WorkerCommands {
    /// Restart a worker's session, e.g. after it went offline
    Restart { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default foreman.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir)?.with_verbose(cli.verbose);

    let mut log_options = LogOptions::new(cli.verbose);
    if matches!(cli.command, Commands::Run { .. } | Commands::Serve { .. }) {
        log_options = log_options.with_log_dir(config.log_dir.clone());
    }
    let _log_guard = logging::init(&log_options)?;

    match cli.command {
        Commands::Init {
            force,
            dry_run,
            reconcile,
        } => cmd::cmd_init(&config, force, dry_run, reconcile).await?,
        Commands::Run {
            once,
            poll_interval,
        } => cmd::cmd_run(config.with_poll_interval(poll_interval), once).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Stuck => cmd::cmd_stuck(&config).await?,
        Commands::Pause => cmd::cmd_pause(&config).await?,
        Commands::Resume => cmd::cmd_resume(&config).await?,
        Commands::Stop => cmd::cmd_stop(&config).await?,
        Commands::Report { command } => cmd::cmd_report(&config, command).await?,
        Commands::Revive { task } => cmd::cmd_revive(&config, &task).await?,
        Commands::Worker { command } => cmd::cmd_worker(&config, command).await?,
        Commands::Serve { port } => cmd::cmd_serve(&config, port).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
        Commands::Reset { force } => cmd::cmd_reset(&config, force).await?,
    }

    Ok(())
}
