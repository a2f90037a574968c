// src/core/transport.rs

//! The cluster transport seam (SPEC_FULL.md §6). The real collaborator — a
//! group-messaging bus providing reliable per-sender FIFO broadcast and
//! membership notifications — is out of scope (spec.md §1); this module
//! gives the rest of the core a concrete `Transport` trait plus one fully
//! functional in-memory implementation usable both for a single-process
//! multi-daemon harness and for tests.

use crate::core::errors::AttrdError;
use crate::core::protocol::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sends and receives protocol envelopes to/from named peers, preserving
/// per-sender FIFO delivery order (spec.md §5).
#[async_trait]
pub trait Transport: Send {
    async fn broadcast(&self, msg: Envelope) -> Result<(), AttrdError>;
    async fn send_to(&self, peer: &str, msg: Envelope) -> Result<(), AttrdError>;
    /// Awaits the next inbound message, returning `(sender, envelope)`.
    /// Returns `None` once the transport is permanently closed.
    async fn recv(&mut self) -> Option<(String, Envelope)>;
}

/// An in-memory `Transport` backed by one `mpsc` channel per node. Not a
/// production cluster messaging bus — building one is out of scope — but a
/// real, fully functional harness for exercising the replication engine
/// against multiple daemons in one process.
pub struct InMemoryTransport {
    node_name: String,
    peers: Arc<HashMap<String, mpsc::Sender<(String, Vec<u8>)>>>,
    rx: mpsc::Receiver<(String, Vec<u8>)>,
}

impl InMemoryTransport {
    /// Builds a fully connected network for the given node names, returning
    /// one endpoint per node. Every node can reach every other node (and
    /// itself, though `broadcast` never loops a message back to its sender).
    pub fn new_network<S: AsRef<str>>(node_names: &[S], capacity: usize) -> HashMap<String, InMemoryTransport> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for name in node_names {
            let name = name.as_ref().to_string();
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(name.clone(), tx);
            receivers.insert(name, rx);
        }
        let senders = Arc::new(senders);
        receivers
            .into_iter()
            .map(|(name, rx)| {
                let transport = InMemoryTransport {
                    node_name: name.clone(),
                    peers: senders.clone(),
                    rx,
                };
                (name, transport)
            })
            .collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn broadcast(&self, msg: Envelope) -> Result<(), AttrdError> {
        let bytes = msg.encode();
        for (name, tx) in self.peers.iter() {
            if name == &self.node_name {
                continue;
            }
            // Best-effort: a full/closed peer channel does not fail the
            // broadcast for everyone else, matching a FIFO group bus where
            // one slow member never blocks delivery to the rest.
            let _ = tx.send((self.node_name.clone(), bytes.clone())).await;
        }
        Ok(())
    }

    async fn send_to(&self, peer: &str, msg: Envelope) -> Result<(), AttrdError> {
        let tx = self
            .peers
            .get(peer)
            .ok_or_else(|| AttrdError::UnknownPeer(peer.to_string()))?;
        tx.send((self.node_name.clone(), msg.encode()))
            .await
            .map_err(|_| AttrdError::Transport(format!("peer '{peer}' channel closed")))
    }

    async fn recv(&mut self) -> Option<(String, Envelope)> {
        loop {
            let (sender, bytes) = self.rx.recv().await?;
            match Envelope::decode(&bytes) {
                Ok(env) => return Some((sender, env)),
                Err(e) => {
                    tracing::warn!(error = %e, from = %sender, "dropping malformed message");
                    continue;
                }
            }
        }
    }
}
