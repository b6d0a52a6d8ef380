use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::ServeArgs;
use crate::paths;
use crate::uffd::{HandlerConfig, HandlerState, RestoreHandler};

pub async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| paths::default_socket_path(&args.mem_file));
    let config = HandlerConfig::new(socket, &args.mem_file)
        .with_workers(args.workers)
        .with_chunk_size(args.chunk_mib.saturating_mul(1024 * 1024))
        .with_handshake_attempts(args.handshake_attempts);

    let handler = RestoreHandler::start(config)
        .await
        .context("starting UFFD handler")?;

    println!("UFFD handler for {}", args.mem_file.display());
    println!("  Socket: {}", handler.socket_path().display());
    println!("  Waiting for Firecracker to load the snapshot...");

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down handler"),
                _ = sigint.recv() => info!("received SIGINT, shutting down handler"),
            }
            stop.cancel();
        }
    });

    match handler.wait(&stop).await {
        Ok(report) => {
            println!(
                "  Restored {} MB in {} ms ({} jobs, {} workers)",
                report.bytes / (1024 * 1024),
                report.elapsed.as_millis(),
                report.jobs,
                report.workers
            );
        }
        Err(e) if e.is_cancelled() => {
            handler.shutdown().await;
            return Ok(());
        }
        Err(e) => {
            handler.shutdown().await;
            return Err(e).context("restoring from snapshot failed");
        }
    }

    if handler.state() == HandlerState::LazyServing {
        println!("  Serving faults on snapshot holes, press Ctrl-C to stop");
        stop.cancelled().await;
    }

    // Cleanup
    info!("cleaning up UFFD handler");
    handler.shutdown().await;
    Ok(())
}
