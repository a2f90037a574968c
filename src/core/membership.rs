// src/core/membership.rs

//! Peer-up/peer-down handling, eviction, and re-sync (component G, spec.md
//! §4.7), plus the protocol-version gate supplemented from
//! `examples/original_source/daemons/attrd/attrd_commands.c`
//! (SPEC_FULL.md §10).

use crate::core::protocol::Message;
use crate::core::replication::ReplicationEngine;
use crate::core::store::AttributeStore;
use std::collections::HashMap;

/// One of the three membership delta kinds the reactor is fed (spec.md
/// §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A numeric cluster id (and, once known, durable CDB identity) learned
    /// for `node`. Has no reaction of its own in spec.md §4.7; the event
    /// loop feeds it straight to the writer's peer cache and the election
    /// gate's voter set.
    NameLearned { node: String, node_id: u64, uuid: Option<String> },
    ProcessMaskChanged { node: String, attrd_running: bool },
    StateChanged { node: String, member: bool, is_remote: bool },
}

/// What the event loop must additionally do after a membership reaction.
#[derive(Debug, Clone, Default)]
pub struct MembershipEffects {
    /// A full snapshot to broadcast (peer joined and this daemon writes).
    pub broadcast: Option<Message>,
    /// How many attributes had a value removed for the evicted node.
    pub evicted_values: usize,
    pub evicted_node: Option<String>,
}

/// Implements component G, plus tracking of each peer's advertised minimum
/// protocol version so a v1 peer is never sent `CLEAR_FAILURE` (spec.md §6,
/// SPEC_FULL.md §10).
#[derive(Default)]
pub struct MembershipReactor {
    peer_versions: HashMap<String, u32>,
}

impl MembershipReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(node: &str) -> String {
        node.to_ascii_lowercase()
    }

    /// Learns a peer's protocol version from its private `#attrd-protocol`
    /// attribute value (spec.md §4.8, last paragraph).
    pub fn observe_protocol_attribute(&mut self, node: &str, value: Option<&str>) {
        if let Some(v) = value.and_then(|s| s.parse::<u32>().ok()) {
            self.peer_versions.insert(Self::key(node), v);
        }
    }

    /// The minimum version to assume for a peer we haven't heard
    /// `#attrd-protocol` from yet (spec.md §6: v1 predecessors).
    pub fn peer_version(&self, node: &str) -> u32 {
        self.peer_versions.get(&Self::key(node)).copied().unwrap_or(1)
    }

    fn evict(&mut self, store: &mut AttributeStore, node: &str) -> MembershipEffects {
        let evicted_values = store.remove_values_for_node(node);
        self.peer_versions.remove(&Self::key(node));
        MembershipEffects {
            broadcast: None,
            evicted_values,
            evicted_node: Some(node.to_string()),
        }
    }

    /// `state_changed` reaction (spec.md §4.7). Eviction never broadcasts;
    /// other peers evict independently from their own membership feed.
    /// On a new, non-remote member joining while this daemon is the writer,
    /// sends it a full snapshot.
    pub fn handle_state_changed(
        &mut self,
        store: &mut AttributeStore,
        replication: &ReplicationEngine,
        node: &str,
        member: bool,
        is_remote: bool,
        is_writer: bool,
    ) -> MembershipEffects {
        if member {
            if is_writer && !is_remote {
                MembershipEffects {
                    broadcast: Some(replication.peer_sync(store)),
                    evicted_values: 0,
                    evicted_node: None,
                }
            } else {
                MembershipEffects::default()
            }
        } else {
            self.evict(store, node)
        }
    }

    /// `process_mask_changed` reaction: a component (e.g. this daemon's peer
    /// process) going away is treated the same as the node leaving
    /// membership (spec.md §4.7).
    pub fn handle_process_mask_changed(
        &mut self,
        store: &mut AttributeStore,
        node: &str,
        attrd_running: bool,
    ) -> MembershipEffects {
        if attrd_running {
            MembershipEffects::default()
        } else {
            self.evict(store, node)
        }
    }
}
