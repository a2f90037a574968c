// src/server/context.rs

use crate::core::cdb::InMemoryCdb;
use crate::core::daemon::{Daemon, DaemonHandles};
use crate::core::election::BullyElection;
use crate::core::transport::InMemoryTransport;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// The concrete daemon instantiation this binary runs. The cluster
/// transport, CDB client, and election library are all external
/// collaborators (spec.md §1); `InMemoryTransport`/`InMemoryCdb`/
/// `BullyElection` are the only implementations of those seams this crate
/// carries (SPEC_FULL.md §6).
pub type ProdDaemon = Daemon<InMemoryTransport, InMemoryCdb, BullyElection>;

/// Holds all the initialized state required to run the daemon's main loop.
pub struct ServerContext {
    pub daemon: ProdDaemon,
    pub handles: DaemonHandles,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
