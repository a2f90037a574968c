// src/server/initialization.rs

//! Builds the daemon and its collaborators from a validated [`Config`]
//! before the main loop starts.

use super::context::{ProdDaemon, ServerContext};
use crate::config::Config;
use crate::core::cdb::InMemoryCdb;
use crate::core::election::BullyElection;
use crate::core::transport::InMemoryTransport;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::info;

const TRANSPORT_CHANNEL_CAPACITY: usize = 256;
const CDB_CALLBACK_CHANNEL_CAPACITY: usize = 256;

/// Initializes the daemon, its transport harness, and its CDB client before
/// the main loop runs.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let transport = build_transport(&config)?;

    let (cdb_tx, cdb_rx) = mpsc::channel(CDB_CALLBACK_CHANNEL_CAPACITY);
    let cdb = Arc::new(InMemoryCdb::new(cdb_tx));

    let election = BullyElection::new(config.node_name.clone(), config.node_id);

    let (daemon, handles): (ProdDaemon, _) = crate::core::daemon::Daemon::new(
        config.node_name.clone(),
        config.propagate_clear_failure_to_peers,
        config.failure_backoff,
        cdb,
        cdb_rx,
        election,
        transport,
        shutdown_rx,
        config.default_dampen_ms,
    );
    info!(node = %config.node_name, peers = config.peers.len(), "daemon state initialized");

    Ok(ServerContext {
        daemon,
        handles,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Builds the in-memory transport harness for this node and its configured
/// peers. The real group-messaging bus is out of scope (spec.md §1); this
/// wires the one fully functional implementation this crate carries
/// (`InMemoryTransport`) into a fully connected network and keeps only this
/// node's own endpoint.
fn build_transport(config: &Config) -> Result<InMemoryTransport> {
    let mut node_names = vec![config.node_name.clone()];
    node_names.extend(config.peers.iter().cloned());

    let mut network = InMemoryTransport::new_network(&node_names, TRANSPORT_CHANNEL_CAPACITY);
    network
        .remove(&config.node_name)
        .ok_or_else(|| anyhow!("failed to allocate transport endpoint for '{}'", config.node_name))
        .with_context(|| "transport harness setup failed")
}

fn log_startup_info(config: &Config) {
    info!(
        node = %config.node_name,
        bind_addr = %config.bind_addr,
        peers = ?config.peers,
        "starting attribute daemon"
    );
}
