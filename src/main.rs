use log::{error, info, warn};
use tokio::time::sleep;

use rust_imu_capture::bluetooth::BluezTransport;
use rust_imu_capture::{RunOutcome, SessionConfig, SessionController, StartOutcome, StopOutcome};

async fn wait_for_stop(config: &SessionConfig) {
    // Stop on Ctrl+C, or after the configured duration when one is set
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    match config.stream_duration {
        Some(duration) => {
            tokio::select! {
                _ = sleep(duration) => info!("Configured stream duration elapsed"),
                _ = &mut rx => info!("Stop requested by user"),
            }
        }
        None => {
            info!("Streaming, press Ctrl+C to stop");
            let _ = rx.await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let transport = BluezTransport::new().await?;
    let controller = SessionController::new(transport, config.clone());

    // Mirror the status line into the log
    let mut status = controller.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            info!("[status] {}", *status.borrow());
        }
    });

    match controller.run().await {
        RunOutcome::Connected { devices, failures } => {
            info!("Connected to {} device(s)", devices);
            for failure in failures {
                warn!("{} ({}) not connected: {}", failure.name, failure.address, failure.reason);
            }
        }
        outcome => {
            warn!("No session to stream: {:?}", outcome);
            return Ok(());
        }
    }

    match controller.start_streaming().await {
        StartOutcome::Started { subscribed, failures } => {
            info!("Streaming from {} device(s)", subscribed);
            for failure in failures {
                warn!("{} not streaming: {}", failure.name, failure.reason);
            }
        }
        outcome => {
            warn!("Streaming did not start: {:?}", outcome);
            return Ok(());
        }
    }

    wait_for_stop(&config).await;

    match controller.stop_streaming().await {
        StopOutcome::Stopped(report) => {
            info!(
                "Session finished with {} aligned rows ({} ms of streaming)",
                report.table.row_count,
                report.table.stop_ms - report.table.checkpoint_ms
            );
            for lost in &report.lost_devices {
                warn!("{} left out of the export: {}", lost.name, lost.reason);
            }
            if let Some(path) = report.export_path {
                info!("Export written to {}", path.display());
            }
        }
        StopOutcome::Rejected => warn!("Stop rejected, session was not streaming"),
    }

    Ok(())
}
