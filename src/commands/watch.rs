//! Watch command - scheduled pipeline runs until Ctrl+C

use anyhow::{Context, Result};
use regime_signals::pipeline::PipelineService;
use regime_signals::PipelineError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::{build_service, load_config};

pub fn run(config_path: String, interval_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        anyhow::bail!("--interval must be at least 1 second");
    }

    // The blocking HTTP client must be created and dropped outside the runtime.
    let service = build_service(load_config(&config_path)?)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(&service, interval_secs))
}

async fn run_async(service: &PipelineService, interval_secs: u64) -> Result<()> {
    info!("Scheduling pipeline runs every {} seconds", interval_secs);

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut cycle_interval = interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = cycle_interval.tick() => {
                let ticket = match service.start() {
                    Ok(ticket) => ticket,
                    Err(PipelineError::RunInProgress) => {
                        warn!("Previous run still in progress, skipping this tick");
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to queue scheduled run: {}", e);
                        continue;
                    }
                };
                // Waiting blocks, so it happens on the blocking pool
                tokio::task::spawn_blocking(move || match ticket.wait() {
                    Ok(snapshot) => info!(
                        "Scheduled run done: Sharpe={:.2}, MDD={:.2}%, meets criteria: {}",
                        snapshot.report.sharpe_ratio,
                        snapshot.report.max_drawdown * 100.0,
                        snapshot.report.meets_criteria
                    ),
                    Err(e) if e.is_recoverable() => warn!("Scheduled run failed: {}", e),
                    Err(e) => error!("Scheduled run hit a defect: {}", e),
                });
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Watch session ended.");
    Ok(())
}
