// src/main.rs

use anyhow::{Context, Result};
use attrd::config::Config;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, reload, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "attrd", version, about = "Cluster-wide node-attribute replication and persistence daemon")]
struct Cli {
    /// Path to the daemon's TOML configuration file.
    #[arg(long, default_value = "attrd.toml")]
    config: String,

    /// Overrides `node_name` from the configuration file.
    #[arg(long)]
    node_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        Config::from_file(&cli.config).with_context(|| format!("loading config from '{}'", cli.config))?;
    if let Some(node_name) = cli.node_name {
        config.node_name = node_name;
    }

    init_tracing(&config.log_level);

    if let Err(e) = attrd::server::run(config).await {
        tracing::error!(error = %e, "daemon exited with an unrecoverable error");
        return Err(e);
    }
    Ok(())
}

/// Installs a reloadable `EnvFilter` layer, matching the teacher's logging
/// setup. No admin op in this daemon changes verbosity at runtime yet, so
/// the returned handle is simply dropped; it costs nothing to keep the
/// plumbing in place for when one is added.
fn init_tracing(log_level: &str) {
    let initial = std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}
