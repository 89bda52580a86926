use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sluice_app::{build_service, AppBuilder, ExecutorHandler, SERVICE};
use sluice_executor::ExecutorConfig;
use sluice_ipc::IpcServer;
use sluice_settings::{default_data_dir_for, expand_path};
use tracing::{info, warn};

/// Sluice execution daemon: runs approved database scripts in an isolated
/// boundary and records exactly one outcome for each.
#[derive(Parser, Debug)]
#[command(name = "sluiced", version)]
struct Args {
    /// Settings file (default: the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// IPC socket path
    #[arg(long)]
    socket: Option<String>,

    /// Data directory for the record database and relational databases
    #[arg(long)]
    data_dir: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let app = AppBuilder::<ExecutorConfig>::new(SERVICE)
        .verbose(args.verbose)
        .config_path(args.config.as_deref())
        .build()
        .context("failed to load settings")?;

    let data_dir = args
        .data_dir
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| default_data_dir_for(SERVICE));
    let service = Arc::new(
        build_service(app.settings.config.clone(), &data_dir)
            .context("failed to start executor")?,
    );
    service.start();

    let socket = args
        .socket
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| sluice_ipc::default_socket_path(SERVICE));
    let server = IpcServer::new(socket);
    let handler = Arc::new(ExecutorHandler::new(service.clone()));

    server
        .run_until(handler, shutdown_signal())
        .await
        .context("IPC server failed")?;

    service.shutdown().await;
    info!("sluiced stopped");
    Ok(())
}
