//! frame-echo-server: length-prefixed TCP echo server
//!
//! Runs until SIGINT or SIGTERM, then stops accepting, drains open
//! connections for the configured grace period and exits.

use frame_echo::shutdown::ShutdownReport;
use frame_echo::{logging, Config, Server};
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("frame-echo-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    logging::init(&config.log_level, false);

    info!(
        host = %config.host,
        port = config.port,
        max_frame_size = config.max_frame_size,
        high_water_mark = config.high_water_mark,
        low_water_mark = config.low_water_mark,
        grace_secs = config.shutdown_grace.as_secs(),
        workers = ?config.workers,
        "Starting frame-echo server"
    );

    match run(config) {
        Ok(report) => {
            info!(drained = report.drained, forced = report.forced, "Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            eprintln!("frame-echo-server: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<ShutdownReport, Box<dyn std::error::Error>> {
    let addr = config.listen_addr()?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::from_config(&config, addr)?;
        Ok::<_, Box<dyn std::error::Error>>(server.run_until(shutdown_signal()).await)
    })
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
