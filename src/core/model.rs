// src/core/model.rs

//! The attribute/value data model (spec.md §3) and its invariants.

use std::collections::HashMap;

/// An opaque tag identifying one outstanding (or completed) CDB write attempt.
/// Tags are handed out in increasing order by the `Writer`, which lets the
/// callback path detect a write whose tag is older than the most recently
/// completed one and treat it as lost (spec.md §4.6 step 2).
pub type WriteTag = u64;

/// State of an attribute's deferred-write timer (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    /// Monotonically increasing generation. Incremented every time the timer
    /// is (re)started so a stale fire (from a timer that was since replaced)
    /// can be recognized and ignored.
    pub generation: u64,
    /// True if this is the temporary 2-second failure-backoff timer rather
    /// than the attribute's configured dampening timer. A backoff timer can
    /// exist even when `dampen_ms == 0` (spec.md invariant 1's documented
    /// exception).
    pub is_backoff: bool,
}

/// An attribute's binding for one specific node (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Canonical (case-preserving) name of the owning node.
    pub node_name: String,
    /// Numeric cluster id; 0 means "not yet learned".
    pub node_id: u64,
    /// True if this value belongs to a node that does not run its own daemon.
    pub is_remote: bool,
    /// The authoritative value. `None` means unset/deleted.
    pub current: Option<String>,
    /// Snapshot of `current` at the moment it was submitted to the CDB.
    /// Non-`None` only while a write for the owning attribute is in flight.
    pub requested: Option<String>,
    /// Transient flag used during sync reconciliation (spec.md §4.5).
    pub seen: bool,
}

impl Value {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            node_id: 0,
            is_remote: false,
            current: None,
            requested: None,
            seen: false,
        }
    }
}

/// Fields supplied when an attribute is first created, mirroring the fields
/// carried on an `UPDATE`/`UPDATE_BOTH` wire message (spec.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct AttributeProto {
    pub set_id: Option<String>,
    pub key_id: Option<String>,
    pub identity: Option<String>,
    pub private: bool,
    pub dampen_ms: u64,
}

/// A named, per-node attribute replicated across all daemons (spec.md §3).
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub set_id: Option<String>,
    pub key_id: Option<String>,
    pub identity: Option<String>,
    pub private: bool,
    pub dampen_ms: u64,
    pub timer: Option<TimerState>,
    /// True while at least one value's persisted copy is older than `current`.
    pub changed: bool,
    /// True if a peer requested an unconditional rewrite on next opportunity.
    pub force_write: bool,
    pub in_flight_tag: Option<WriteTag>,
    /// True if the last write attempt skipped a value due to an unknown durable node id.
    pub unknown_peer_ids: bool,
    /// Values keyed by the lowercased node name (node-name comparisons are
    /// case-insensitive per spec.md §9's design note).
    values: HashMap<String, Value>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, proto: &AttributeProto) -> Self {
        Self {
            name: name.into(),
            set_id: proto.set_id.clone(),
            key_id: proto.key_id.clone(),
            identity: proto.identity.clone(),
            private: proto.private,
            dampen_ms: proto.dampen_ms,
            timer: None,
            changed: false,
            force_write: false,
            in_flight_tag: None,
            unknown_peer_ids: false,
            values: HashMap::new(),
        }
    }

    fn key(node_name: &str) -> String {
        node_name.to_ascii_lowercase()
    }

    pub fn get_value(&self, node_name: &str) -> Option<&Value> {
        self.values.get(&Self::key(node_name))
    }

    pub fn get_value_mut(&mut self, node_name: &str) -> Option<&mut Value> {
        self.values.get_mut(&Self::key(node_name))
    }

    /// Returns the existing value for `node_name`, creating it if absent.
    pub fn get_or_create_value(&mut self, node_name: &str) -> &mut Value {
        self.values
            .entry(Self::key(node_name))
            .or_insert_with(|| Value::new(node_name))
    }

    pub fn remove_value(&mut self, node_name: &str) -> Option<Value> {
        self.values.remove(&Self::key(node_name))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.values.values_mut()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.values.values().map(|v| v.node_name.clone()).collect()
    }

    pub fn clear_seen(&mut self) {
        for v in self.values.values_mut() {
            v.seen = false;
        }
    }

    /// True iff any value has `requested.is_some()`. Backs invariant 2/3.
    pub fn has_requested_values(&self) -> bool {
        self.values.values().any(|v| v.requested.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_lookup_is_case_insensitive() {
        let mut a = Attribute::new("shoe-size", &AttributeProto::default());
        a.get_or_create_value("Node1").current = Some("42".into());
        assert_eq!(
            a.get_value("NODE1").and_then(|v| v.current.clone()),
            Some("42".into())
        );
    }

    #[test]
    fn attribute_name_is_case_sensitive_by_construction() {
        // Attribute names are looked up by exact key in the AttributeStore
        // (see store.rs); this test only documents that `Attribute` itself
        // does not normalize its own `name` field.
        let a = Attribute::new("Shoe-Size", &AttributeProto::default());
        assert_eq!(a.name, "Shoe-Size");
    }
}
