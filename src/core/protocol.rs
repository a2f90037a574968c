// src/core/protocol.rs

//! Wire messages for the broadcast protocol (component C, spec.md §4.3).

use crate::core::errors::AttrdError;
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build. Version 1 predecessors omit
/// [`Message::ClearFailure`]; every other op MUST still be accepted from a
/// v1 sender (spec.md §6).
pub const PROTOCOL_VERSION: u32 = 2;

/// Fields shared by `UPDATE`, `UPDATE_DELAY`, and `UPDATE_BOTH` (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UpdateFields {
    pub name: String,
    pub set_id: Option<String>,
    pub key_id: Option<String>,
    pub identity: Option<String>,
    /// Absent means "apply to every node currently known for this attribute"
    /// (spec.md §4.5 step 4).
    pub target_node: Option<String>,
    pub target_node_id: u64,
    /// Concrete value already resolved from any `++`/`+=N` expansion
    /// (spec.md §4.3); `None` means delete.
    pub value: Option<String>,
    /// Present only on `UPDATE_DELAY`/`UPDATE_BOTH`.
    pub dampen_ms: Option<u64>,
    pub is_private: bool,
    pub is_remote: bool,
    pub is_force_write: bool,
}

impl UpdateFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            set_id: None,
            key_id: None,
            identity: None,
            target_node: None,
            target_node_id: 0,
            value: None,
            dampen_ms: None,
            is_private: false,
            is_remote: false,
            is_force_write: false,
        }
    }
}

/// One `(attribute, node)` value as carried in a `SYNC_RESPONSE` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SyncRecord {
    pub name: String,
    pub set_id: Option<String>,
    pub key_id: Option<String>,
    pub identity: Option<String>,
    pub node: String,
    pub node_id: u64,
    pub value: Option<String>,
    pub dampen_ms: u64,
    pub is_private: bool,
    pub is_remote: bool,
}

/// A reply to a `QUERY`: either one host's value or every host's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct QueryReplyEntry {
    pub host: String,
    pub value: Option<String>,
}

/// Pass-through election sub-messages (spec.md §4.4); the body is opaque to
/// the replication engine and handed directly to the `ElectionGate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ElectionOp {
    Vote { epoch: u64, candidate: String },
    Count { epoch: u64 },
    Winner { epoch: u64, node: String },
}

/// The full set of recognized broadcast protocol operations (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum Message {
    Update(UpdateFields),
    UpdateDelay(UpdateFields),
    UpdateBoth(UpdateFields),
    PeerRemove { node: String, node_id: u64 },
    ClearFailure {
        resource: Option<String>,
        operation: Option<String>,
        interval_ms: Option<u64>,
    },
    Sync,
    SyncResponse(Vec<SyncRecord>),
    Query { name: String, host: Option<String> },
    QueryReply { name: String, entries: Vec<QueryReplyEntry> },
    Election(ElectionOp),
}

/// The outer envelope every message travels in: a protocol version, the
/// sending node's name, and an optional `writer_id` annotation so peers can
/// observe who currently believes itself the writer (spec.md §4.3,
/// SPEC_FULL.md §10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Envelope {
    pub version: u32,
    pub sender: String,
    pub writer_id: Option<String>,
    pub body: Message,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, writer_id: Option<String>, body: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender: sender.into(),
            writer_id,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .expect("Envelope encoding is infallible for in-memory types")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AttrdError> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(envelope, _)| envelope)
            .map_err(|e| AttrdError::MalformedMessage(e.to_string()))
    }

    /// True if this message may be sent to a peer advertising `peer_version`
    /// (spec.md §6: v1 predecessors omit `CLEAR_FAILURE`).
    pub fn supported_by(&self, peer_version: u32) -> bool {
        if peer_version >= 2 {
            return true;
        }
        !matches!(self.body, Message::ClearFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_bincode() {
        let env = Envelope::new(
            "n1",
            Some("n1".to_string()),
            Message::Update(UpdateFields {
                value: Some("42".to_string()),
                ..UpdateFields::new("shoe-size")
            }),
        );
        let bytes = env.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn v1_peers_never_receive_clear_failure() {
        let env = Envelope::new(
            "n1",
            None,
            Message::ClearFailure {
                resource: None,
                operation: None,
                interval_ms: None,
            },
        );
        assert!(!env.supported_by(1));
        assert!(env.supported_by(2));
    }

    #[test]
    fn v1_peers_receive_every_other_op() {
        let env = Envelope::new("n1", None, Message::Sync);
        assert!(env.supported_by(1));
    }
}
