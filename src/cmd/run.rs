//! Poll loop and snapshot server commands: `foreman run`, `foreman serve`.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use foreman::config::Config;
use foreman::orchestrator::{Orchestrator, TickOutcome};
use foreman::server;

pub async fn cmd_run(config: Config, once: bool) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }
    // Fail early with a clear message before any tick runs.
    let store = config.store();
    store.load().await?;

    let orchestrator = Orchestrator::from_config(&config);

    if once {
        let report = orchestrator.poll_once().await?;
        println!(
            "Poll #{}: {:?}. {} merged, {} rejected, {} escalated, {} advised, {} assigned.",
            report.poll,
            report.outcome,
            report.review.merged.len(),
            report.review.rejected.len(),
            report.review.escalated.len(),
            report.oracle.advised.len(),
            report.assigned.len()
        );
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current tick");
            let _ = stop_tx.send(true);
        }
    });

    match orchestrator.run(stop_rx).await? {
        TickOutcome::Complete => {
            println!("All tasks settled. Run `foreman stuck` for anything left over.")
        }
        _ => println!("Orchestrator stopped."),
    }
    Ok(())
}

pub async fn cmd_serve(config: &Config, port: u16) -> Result<()> {
    server::start_server(port, config.store()).await
}
