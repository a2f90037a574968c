// src/server/spawner.rs

//! Spawns the daemon's background tasks: currently just the shutdown-signal
//! listener. The daemon's own event loop (timers, CDB callbacks, transport)
//! is driven by `core::daemon::Daemon::run` itself rather than a spawned
//! task, since `daemon_loop::run` awaits it directly.

use super::context::ServerContext;
use anyhow::Result;
use tracing::info;

#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system: SIGINT/SIGTERM
/// on Unix, Ctrl+C on Windows.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("failed to install Ctrl+C handler");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; } } => {
            info!("SIGINT received, initiating graceful shutdown");
        }
        _ = async { #[cfg(unix)] { sigterm.recv().await; } } => {
            info!("SIGTERM received, initiating graceful shutdown");
        }
        _ = async { #[cfg(windows)] { let _ = ctrl_c.await; } } => {
            info!("Ctrl-C received, initiating graceful shutdown");
        }
    }
}

/// Spawns the daemon's background tasks into `ctx.background_tasks`.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let shutdown_tx = ctx.shutdown_tx.clone();
    ctx.background_tasks.spawn(async move {
        await_shutdown_signal().await;
        let _ = shutdown_tx.send(());
        Ok(())
    });
    info!("background tasks spawned");
    Ok(())
}
