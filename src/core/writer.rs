// src/core/writer.rs

//! Batched persistence to the CDB with retry/backoff (component F, spec.md
//! §4.6). Grounded on the teacher's `core/persistence/aof_writer.rs`: a
//! single owner drives writes through a fallible external sink and re-arms
//! on failure rather than panicking or blocking the event loop.

use crate::core::cdb::{AttrSet, CdbClient, CdbResult, CdbTag, NodeState, NvPair, StatusTree, TransientNodeAttrs};
use crate::core::errors::AttrdError;
use crate::core::store::AttributeStore;
use crate::core::timers::TimerDriver;
use std::collections::HashMap;
use std::sync::Arc;

/// A durably-known peer: its numeric cluster id and CDB identity (`uuid`).
/// `uuid` is `None` until the membership reactor learns it (spec.md §4.6
/// step 5, §4.5 step 10).
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: u64,
    pub uuid: Option<String>,
}

/// What the event loop must do after a CDB callback is processed (spec.md
/// §4.6 callback logic, steps 4-6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCallbackAction {
    /// Nothing further: the attribute has no pending changes, or this
    /// daemon is no longer the writer.
    None,
    /// Re-issue `write(a, ignore_delay = false)` immediately.
    RewriteNow,
    /// Arm (or leave running) the attribute's configured dampening timer.
    ArmDampeningTimer,
    /// Arm the 2-second failure-backoff timer (spec.md §4.2).
    ArmFailureBackoff,
}

/// Drives persistence of attributes into the CDB, one write in flight per
/// attribute (spec.md invariant 3).
pub struct Writer<C: CdbClient> {
    cdb: Arc<C>,
    peer_cache: HashMap<String, PeerInfo>,
    /// High-water mark of the most recently completed tag, used to detect a
    /// lost in-flight write (spec.md §4.6 step 2).
    last_done: CdbTag,
    /// Maps an outstanding tag back to the attribute name that submitted it.
    pending: HashMap<CdbTag, String>,
    private_writes_skipped: u64,
}

impl<C: CdbClient> Writer<C> {
    pub fn new(cdb: Arc<C>) -> Self {
        Self {
            cdb,
            peer_cache: HashMap::new(),
            last_done: 0,
            pending: HashMap::new(),
            private_writes_skipped: 0,
        }
    }

    fn key(node_name: &str) -> String {
        node_name.to_ascii_lowercase()
    }

    /// Registers or updates a peer's durable identity (spec.md §4.6 step 5).
    pub fn register_peer(&mut self, node_name: &str, node_id: u64, uuid: Option<String>) {
        self.peer_cache
            .entry(Self::key(node_name))
            .and_modify(|p| {
                p.node_id = node_id;
                if uuid.is_some() {
                    p.uuid = uuid.clone();
                }
            })
            .or_insert(PeerInfo { node_id, uuid });
    }

    pub fn forget_peer(&mut self, node_name: &str) {
        self.peer_cache.remove(&Self::key(node_name));
    }

    /// Names of every peer registered so far (lowercased), for the
    /// protocol-version send gate (spec.md §6, SPEC_FULL.md §10).
    pub fn known_peer_names(&self) -> impl Iterator<Item = &str> {
        self.peer_cache.keys().map(String::as_str)
    }

    /// Resolves a bare numeric cluster id to its node name, for `peer-remove`
    /// requests that only supply an id (spec.md §4.8).
    pub fn find_peer_by_id(&self, node_id: u64) -> Option<String> {
        self.peer_cache
            .iter()
            .find(|(_, info)| info.node_id == node_id)
            .map(|(name, _)| name.clone())
    }

    pub fn private_writes_skipped(&self) -> u64 {
        self.private_writes_skipped
    }

    /// Writes a single attribute (spec.md §4.6).
    pub async fn write(
        &mut self,
        store: &mut AttributeStore,
        timers: &mut TimerDriver,
        name: &str,
        ignore_delay: bool,
    ) -> Result<(), AttrdError> {
        let Some(attr) = store.lookup_mut(name) else {
            return Ok(());
        };

        if attr.private {
            self.private_writes_skipped += 1;
            return Ok(());
        }

        if let Some(tag) = attr.in_flight_tag {
            if tag < self.last_done {
                tracing::warn!(attribute = name, tag, last_done = self.last_done, "in-flight CDB write presumed lost");
                attr.in_flight_tag = None;
                self.pending.remove(&tag);
            } else {
                return Ok(());
            }
        }

        if timers.is_running(name) {
            if ignore_delay {
                timers.cancel(name);
            } else {
                return Ok(());
            }
        }

        attr.changed = false;
        attr.unknown_peer_ids = false;
        attr.force_write = false;

        let set_id = attr.set_id.clone();
        let key_id = attr.key_id.clone();
        let attr_name = attr.name.clone();
        let mut per_peer: HashMap<String, Vec<NvPair>> = HashMap::new();
        let mut unknown_peer_ids = false;

        for v in attr.values_mut() {
            let Some(peer) = self.peer_cache.get(&Self::key(&v.node_name)) else {
                tracing::debug!(attribute = %attr_name, node = %v.node_name, "peer not yet in cache, skipping value");
                continue;
            };
            let Some(uuid) = peer.uuid.clone() else {
                tracing::debug!(attribute = %attr_name, node = %v.node_name, "peer durable id not yet learned, skipping value");
                unknown_peer_ids = true;
                continue;
            };
            let resolved_set_id = set_id.clone().unwrap_or_else(|| format!("status-{uuid}"));
            let resolved_key_id = key_id
                .clone()
                .unwrap_or_else(|| format!("{resolved_set_id}-{attr_name}"));
            per_peer.entry(uuid).or_default().push(NvPair {
                id: resolved_key_id,
                name: attr_name.clone(),
                value: v.current.clone(),
            });
            v.requested = v.current.clone();
        }
        attr.unknown_peer_ids = unknown_peer_ids;

        if per_peer.is_empty() {
            return Ok(());
        }

        let mut node_states = Vec::with_capacity(per_peer.len());
        let mut any_delete = false;
        for (uuid, nvpairs) in per_peer {
            any_delete |= nvpairs.iter().any(|nv| nv.value.is_none());
            let set_id = set_id.clone().unwrap_or_else(|| format!("status-{uuid}"));
            node_states.push(NodeState {
                id: uuid.clone(),
                transient_attrs: TransientNodeAttrs {
                    id: uuid,
                    attr_sets: vec![AttrSet { id: set_id, nvpairs }],
                },
            });
        }
        let tree = StatusTree { node_states, is_mixed_update: any_delete };

        let tag = self.cdb.submit(tree).await?;
        let attr = store
            .lookup_mut(name)
            .expect("attribute cannot be removed while a write for it is being submitted");
        attr.in_flight_tag = Some(tag);
        self.pending.insert(tag, name.to_string());
        tracing::info!(attribute = name, tag, "submitted CDB write");
        Ok(())
    }

    /// Writes every attribute for which `!changed_only || a.changed ||
    /// a.unknown_peer_ids || a.force_write` (spec.md §4.6).
    pub async fn write_all(
        &mut self,
        store: &mut AttributeStore,
        timers: &mut TimerDriver,
        changed_only: bool,
        ignore_delay: bool,
    ) -> Result<(), AttrdError> {
        let names: Vec<String> = store
            .iter()
            .filter(|(_, a)| !changed_only || a.changed || a.unknown_peer_ids || a.force_write)
            .map(|(n, _)| n.to_string())
            .collect();
        for name in names {
            self.write(store, timers, &name, ignore_delay).await?;
        }
        Ok(())
    }

    /// Processes a `(tag, result)` callback from the CDB client (spec.md
    /// §4.6 callback logic), returning the attribute it was for alongside
    /// what the event loop must do next. `is_writer` reflects whether this
    /// daemon still holds the writer role at the time the callback arrives.
    pub fn handle_callback(
        &mut self,
        store: &mut AttributeStore,
        timers: &mut TimerDriver,
        tag: CdbTag,
        result: CdbResult,
        is_writer: bool,
    ) -> Result<(Option<String>, WriteCallbackAction), AttrdError> {
        let Some(name) = self.pending.remove(&tag) else {
            return Ok((None, WriteCallbackAction::None));
        };
        let Some(attr) = store.lookup_mut(&name) else {
            return Ok((Some(name), WriteCallbackAction::None));
        };
        attr.in_flight_tag = None;

        let rc_ok = matches!(result, CdbResult::Ok);
        if rc_ok {
            self.last_done = self.last_done.max(tag);
            if attr.dampen_ms == 0 && attr.timer.map(|t| t.is_backoff).unwrap_or(false) {
                timers.cancel(&name);
                attr.timer = None;
            }
        }
        for v in attr.values_mut() {
            v.requested = None;
        }
        if !rc_ok {
            attr.changed = true;
        }

        match &result {
            CdbResult::Ok => {}
            CdbResult::Retryable(reason) => {
                tracing::warn!(attribute = %name, reason, "CDB write failed, will retry");
            }
            CdbResult::Fatal(reason) => {
                tracing::error!(attribute = %name, reason, "CDB connection lost");
                return Err(AttrdError::Cdb(reason.clone()));
            }
        }

        if !attr.changed || !is_writer {
            return Ok((Some(name), WriteCallbackAction::None));
        }
        let action = if rc_ok {
            WriteCallbackAction::RewriteNow
        } else if attr.dampen_ms > 0 {
            WriteCallbackAction::ArmDampeningTimer
        } else {
            WriteCallbackAction::ArmFailureBackoff
        };
        Ok((Some(name), action))
    }
}
