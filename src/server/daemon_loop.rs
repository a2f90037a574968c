// src/server/daemon_loop.rs

//! Drives the daemon's event loop to completion while keeping an eye on the
//! other background tasks (spec.md §5, §7).

use super::context::ServerContext;
use anyhow::Result;
use tracing::{error, info};

/// Runs the daemon until it returns, which only happens on an unrecoverable
/// transport or CDB failure (spec.md §7); the caller (`main`) logs that and
/// exits non-zero for the supervisor to restart.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let daemon_fut = ctx.daemon.run();
    tokio::pin!(daemon_fut);

    loop {
        tokio::select! {
            biased;

            Some(res) = ctx.background_tasks.join_next(), if !ctx.background_tasks.is_empty() => {
                match res {
                    Ok(Ok(())) => info!("a background task has completed"),
                    Ok(Err(e)) => error!("background task failed: {e}"),
                    Err(e) => error!("background task panicked: {e:?}"),
                }
            }
            result = &mut daemon_fut => {
                return result.map_err(Into::into);
            }
        }
    }
}
