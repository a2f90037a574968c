// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod context;
mod daemon_loop;
mod initialization;
mod spawner;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let mut ctx = initialization::setup(config).await?;
    spawner::spawn_all(&mut ctx).await?;
    daemon_loop::run(ctx).await
}
