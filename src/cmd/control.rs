//! Operator controls: `foreman pause|resume|stop|reset`.

use anyhow::Result;
use chrono::Utc;

use foreman::config::Config;
use foreman::errors::StoreError;
use foreman::state::OrchestratorStatus;

async fn set_status(config: &Config, status: OrchestratorStatus) -> Result<bool> {
    let changed = config
        .store()
        .update(|state| Ok::<_, StoreError>(state.set_orchestrator_status(status, Utc::now())))
        .await?;
    Ok(changed)
}

pub async fn cmd_pause(config: &Config) -> Result<()> {
    if set_status(config, OrchestratorStatus::Paused).await? {
        println!("Paused. Polls are recorded but nothing is assigned or reviewed.");
    } else {
        println!("Already paused.");
    }
    Ok(())
}

pub async fn cmd_resume(config: &Config) -> Result<()> {
    if set_status(config, OrchestratorStatus::Active).await? {
        println!("Resumed.");
    } else {
        println!("Not paused.");
    }
    Ok(())
}

pub async fn cmd_stop(config: &Config) -> Result<()> {
    set_status(config, OrchestratorStatus::Stopped).await?;
    println!("Stop requested. A running orchestrator exits at its next tick.");
    Ok(())
}

pub async fn cmd_reset(config: &Config, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let store = config.store();
    if !store.exists() {
        println!("Nothing to reset.");
        return Ok(());
    }

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This deletes all pipeline progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    if store.reset().await? {
        println!("State reset. Run `foreman init` to start over.");
    }
    Ok(())
}
