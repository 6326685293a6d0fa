//! Configuration view and validation commands: `foreman config`.

use anyhow::Result;

use foreman::config::Config;
use foreman::foreman_config::ForemanToml;

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.foreman_dir.join("foreman.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foreman.toml found at {}", config_path.display());
                println!("Using defaults. Run 'foreman config init' to create one.");
            }
            println!();

            // Effective values include environment overrides.
            let toml = &config.toml;
            println!("[project]");
            println!("  name = \"{}\"", config.project_name);
            println!("  main_branch = \"{}\"", toml.project.main_branch);
            println!("  branch_prefix = \"{}\"", toml.project.branch_prefix);
            println!();
            println!("[orchestrator]");
            println!("  poll_interval_secs = {}", toml.orchestrator.poll_interval_secs);
            println!("  worker_timeout_secs = {}", toml.orchestrator.worker_timeout_secs);
            println!("  max_retries = {}", toml.orchestrator.max_retries);
            println!();
            println!("[review]");
            println!("  enabled = {}", toml.review.enabled);
            println!("  max_attempts = {}", toml.review.max_attempts);
            println!("  claude_cmd = \"{}\"", config.claude_cmd());
            println!("  timeout_secs = {}", toml.review.timeout_secs);
            println!("  diff_limit = {}", toml.review.diff_limit);
            println!("  auto_push = {}", toml.review.auto_push);
            println!();
            println!("[oracle]");
            println!("  enabled = {}", toml.oracle.enabled);
            println!();
            println!("[store]");
            println!("  lock_retries = {}", toml.store.lock_retries);
            println!(
                "  lock_backoff_ms = {}..{}",
                toml.store.lock_min_backoff_ms, toml.store.lock_max_backoff_ms
            );
            println!("  activity_limit = {}", toml.store.activity_limit);
            println!();
            println!("[sessions]");
            println!("  prefix = \"{}\"", toml.sessions.prefix);
            println!("  agent_cmd = \"{}\"", toml.sessions.agent_cmd);
            println!("  command_timeout_secs = {}", toml.sessions.command_timeout_secs);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("foreman.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.foreman_dir)?;
            ForemanToml::default().save(&config_path)?;

            println!("Created foreman.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [orchestrator] poll interval, worker timeout, retries");
            println!("  - [review] reviewer command and attempt limit");
            println!("  - [oracle] advice for stuck tasks");
            println!("  - [sessions] worker id prefix and agent command");
            println!();
        }
    }

    Ok(())
}
