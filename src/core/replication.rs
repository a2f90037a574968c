// src/core/replication.rs

//! State transitions on inbound broadcast messages and synchronization of
//! joining/diverged peers (component E, spec.md §4.5). This module performs
//! pure state transitions over the `AttributeStore`; it never touches the
//! transport, the writer, or the election gate directly. Instead every
//! operation returns an "effects" value describing what the event loop
//! (`core::daemon`) must additionally do — start a timer, invoke
//! write-or-elect, broadcast a correction — so this component stays fully
//! unit-testable against a bare `AttributeStore`.

use crate::core::dispatcher::clear_failure_regex;
use crate::core::errors::AttrdError;
use crate::core::model::AttributeProto;
use crate::core::protocol::{Message, SyncRecord, UpdateFields};
use crate::core::store::AttributeStore;

/// Which of the three update-shaped ops produced a [`UpdateFields`] (spec.md
/// §4.3); `peer_update` treats them slightly differently (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Update,
    UpdateDelay,
    UpdateBoth,
}

/// Side effects the event loop must carry out after a `peer_update` call.
#[derive(Debug, Clone, Default)]
pub struct PeerUpdateEffects {
    pub attr_name: String,
    /// The configured dampening changed; cancel/replace the timer and run
    /// write-or-elect immediately regardless of the value path below
    /// (spec.md §4.5 step 3).
    pub dampen_changed: bool,
    /// A value changed and the attribute dampens; (re)start its timer.
    pub start_timer: bool,
    /// A value changed and the attribute writes immediately.
    pub needs_write_or_elect: bool,
    /// Correction broadcasts produced by the local-owner veto (step 6).
    pub broadcast: Vec<Message>,
    /// `(node_name, node_id)` learned from this message (step 10).
    pub learned_peer: Option<(String, u64)>,
}

impl PeerUpdateEffects {
    fn merge(&mut self, other: PeerUpdateEffects) {
        self.dampen_changed |= other.dampen_changed;
        self.start_timer |= other.start_timer;
        self.needs_write_or_elect |= other.needs_write_or_elect;
        self.broadcast.extend(other.broadcast);
        if other.learned_peer.is_some() {
            self.learned_peer = other.learned_peer;
        }
    }
}

/// Tracks, per the replication engine's own view, what happened while
/// reconciling a `SYNC_RESPONSE`.
#[derive(Debug, Clone, Default)]
pub struct SyncResponseEffects {
    pub per_attribute: Vec<PeerUpdateEffects>,
    pub broadcast: Vec<Message>,
}

/// Implements component E. Holds only the bits of local identity needed to
/// resolve "is this update about me" (the local-owner veto) and "has the
/// writer changed" (new-writer detection, SPEC_FULL.md §10).
pub struct ReplicationEngine {
    local_node: String,
    current_writer: Option<String>,
    /// `dampen_ms` applied to an attribute created without an explicit value
    /// (`Config::default_dampen_ms`); zero unless overridden.
    default_dampen_ms: u64,
}

impl ReplicationEngine {
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
            current_writer: None,
            default_dampen_ms: 0,
        }
    }

    pub fn with_default_dampen_ms(mut self, default_dampen_ms: u64) -> Self {
        self.default_dampen_ms = default_dampen_ms;
        self
    }

    /// Updates the believed-writer tracking from an envelope's `writer_id`
    /// annotation, returning true if this is a different writer than last
    /// observed (SPEC_FULL.md §10).
    pub fn observe_writer_id(&mut self, writer_id: Option<&str>) -> bool {
        let is_new = match (writer_id, self.current_writer.as_deref()) {
            (Some(w), Some(cur)) => w != cur,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if let Some(w) = writer_id {
            self.current_writer = Some(w.to_string());
        }
        is_new
    }

    /// The protocol's central state transition (spec.md §4.5).
    pub fn peer_update(
        &mut self,
        store: &mut AttributeStore,
        op: UpdateOp,
        msg: &UpdateFields,
        target_node: Option<&str>,
        filter: bool,
    ) -> Result<PeerUpdateEffects, AttrdError> {
        if msg.name.trim().is_empty() {
            tracing::warn!("dropping update with missing attribute name");
            return Ok(PeerUpdateEffects::default());
        }

        if !store.contains(&msg.name) && matches!(op, UpdateOp::UpdateDelay) {
            tracing::warn!(attribute = %msg.name, "UPDATE_DELAY for unknown attribute, dropping");
            return Ok(PeerUpdateEffects::default());
        }

        let proto = AttributeProto {
            set_id: msg.set_id.clone(),
            key_id: msg.key_id.clone(),
            identity: msg.identity.clone(),
            private: msg.is_private,
            dampen_ms: msg.dampen_ms.unwrap_or(self.default_dampen_ms),
        };
        let mut effects = PeerUpdateEffects {
            attr_name: msg.name.clone(),
            ..Default::default()
        };

        {
            let attr = store.get_or_create(&msg.name, &proto);
            if matches!(op, UpdateOp::UpdateDelay | UpdateOp::UpdateBoth) {
                let Some(new_dampen) = msg.dampen_ms else {
                    return Err(AttrdError::InvalidDampening(format!(
                        "{} is missing dampen_ms on a dampening-changing op",
                        msg.name
                    )));
                };
                if new_dampen != attr.dampen_ms {
                    attr.dampen_ms = new_dampen;
                    effects.dampen_changed = true;
                }
                if matches!(op, UpdateOp::UpdateDelay) {
                    return Ok(effects);
                }
            }
        }

        let targets: Vec<String> = match target_node {
            Some(t) => vec![t.to_string()],
            None => store
                .lookup(&msg.name)
                .map(|a| a.node_names())
                .unwrap_or_default(),
        };
        if targets.is_empty() {
            return Ok(effects);
        }

        for target in targets {
            self.apply_value_update(store, msg, &target, filter, &mut effects)?;
        }
        Ok(effects)
    }

    /// Steps 5-10 of `peer_update`, applied to a single target node.
    fn apply_value_update(
        &self,
        store: &mut AttributeStore,
        msg: &UpdateFields,
        target: &str,
        filter: bool,
        effects: &mut PeerUpdateEffects,
    ) -> Result<(), AttrdError> {
        let attr = store
            .lookup_mut(&msg.name)
            .expect("attribute was just looked up or created above");
        let is_local = target.eq_ignore_ascii_case(&self.local_node);

        let attr_snapshot_name = attr.name.clone();
        let attr_set_id = attr.set_id.clone();
        let attr_key_id = attr.key_id.clone();
        let attr_identity = attr.identity.clone();
        let attr_private = attr.private;
        let attr_dampen_ms = attr.dampen_ms;

        let v = attr.get_or_create_value(target);
        if msg.is_remote {
            v.is_remote = true;
        }

        if filter && is_local && msg.value != v.current {
            // Local-owner veto (step 6): our own value always wins; restate
            // it so the divergent peer corrects itself, without mutating.
            effects.broadcast.push(Message::SyncResponse(vec![SyncRecord {
                name: attr_snapshot_name,
                set_id: attr_set_id,
                key_id: attr_key_id,
                identity: attr_identity,
                node: v.node_name.clone(),
                node_id: v.node_id,
                value: v.current.clone(),
                dampen_ms: attr_dampen_ms,
                is_private: attr_private,
                is_remote: v.is_remote,
            }]));
        } else if msg.value != v.current {
            v.current = msg.value.clone();
            attr.changed = true;
            if attr_dampen_ms > 0 {
                effects.start_timer = true;
            } else {
                effects.needs_write_or_elect = true;
            }
        } else if msg.is_force_write && attr_dampen_ms > 0 {
            attr.force_write = true;
        }

        let attr = store.lookup_mut(&msg.name).expect("attribute still present");
        let v = attr.get_value_mut(target).expect("value was just created above");
        v.seen = true;
        if v.node_id == 0 && !msg.is_remote && msg.target_node_id != 0 {
            v.node_id = msg.target_node_id;
            effects.learned_peer = Some((v.node_name.clone(), msg.target_node_id));
        }
        Ok(())
    }

    /// Builds the full-table snapshot sent in reply to `SYNC` (spec.md
    /// §4.5). Private attributes are included: they replicate, they just
    /// never reach the CDB.
    pub fn peer_sync(&self, store: &AttributeStore) -> Message {
        Message::SyncResponse(self.snapshot_records(store, |_, _| true))
    }

    fn snapshot_records(
        &self,
        store: &AttributeStore,
        mut include: impl FnMut(&str, &crate::core::model::Value) -> bool,
    ) -> Vec<SyncRecord> {
        let mut records = Vec::new();
        for (_, attr) in store.iter() {
            for v in attr.values() {
                if !include(&attr.name, v) {
                    continue;
                }
                records.push(SyncRecord {
                    name: attr.name.clone(),
                    set_id: attr.set_id.clone(),
                    key_id: attr.key_id.clone(),
                    identity: attr.identity.clone(),
                    node: v.node_name.clone(),
                    node_id: v.node_id,
                    value: v.current.clone(),
                    dampen_ms: attr.dampen_ms,
                    is_private: attr.private,
                    is_remote: v.is_remote,
                });
            }
        }
        records
    }

    /// Reconciles an inbound `SYNC_RESPONSE` (spec.md §4.5).
    pub fn handle_sync_response(
        &mut self,
        store: &mut AttributeStore,
        records: &[SyncRecord],
        is_new_writer: bool,
    ) -> Result<SyncResponseEffects, AttrdError> {
        let mut out = SyncResponseEffects::default();
        if is_new_writer {
            store.clear_seen();
        }
        for rec in records {
            let msg = UpdateFields {
                name: rec.name.clone(),
                set_id: rec.set_id.clone(),
                key_id: rec.key_id.clone(),
                identity: rec.identity.clone(),
                target_node: Some(rec.node.clone()),
                target_node_id: rec.node_id,
                value: rec.value.clone(),
                dampen_ms: Some(rec.dampen_ms),
                is_private: rec.is_private,
                is_remote: rec.is_remote,
                is_force_write: false,
            };
            let mut effects = self.peer_update(store, UpdateOp::UpdateBoth, &msg, Some(rec.node.as_str()), true)?;
            out.broadcast.extend(std::mem::take(&mut effects.broadcast));
            out.per_attribute.push(effects);
        }
        if is_new_writer {
            let unseen_local = self.snapshot_records(store, |_, v| {
                v.node_name.eq_ignore_ascii_case(&self.local_node) && !v.seen
            });
            if !unseen_local.is_empty() {
                out.broadcast.push(Message::SyncResponse(unseen_local));
            }
        }
        Ok(out)
    }

    /// `PEER_REMOVE` (spec.md §4.5): evict all of `node`'s values. Does not
    /// broadcast further (peers evict independently from their own
    /// membership feed).
    pub fn handle_peer_remove(&self, store: &mut AttributeStore, node: &str) -> usize {
        store.remove_values_for_node(node)
    }

    /// `CLEAR_FAILURE` (spec.md §4.5): expand to one `peer_update` delete per
    /// matching attribute name.
    pub fn handle_clear_failure(
        &mut self,
        store: &mut AttributeStore,
        resource: Option<&str>,
        operation: Option<&str>,
        interval_ms: Option<u64>,
    ) -> Result<Vec<PeerUpdateEffects>, AttrdError> {
        let re = clear_failure_regex(resource, operation, interval_ms)?;
        let names: Vec<String> = store.names().filter(|n| re.is_match(n)).map(String::from).collect();
        let mut all = Vec::with_capacity(names.len());
        for name in names {
            let msg = UpdateFields {
                value: None,
                ..UpdateFields::new(name)
            };
            all.push(self.peer_update(store, UpdateOp::Update, &msg, None, false)?);
        }
        Ok(all)
    }
}
