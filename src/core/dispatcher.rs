// src/core/dispatcher.rs

//! Translates local client operations into broadcast messages (component H,
//! spec.md §4.8). Local client IPC itself is out of scope (spec.md §1); per
//! SPEC_FULL.md §6 it is modeled here as a [`ClientRequest`] enum delivered
//! over an `mpsc` channel with replies on a `oneshot` channel, the way the
//! real local transport would deliver requests to this dispatcher.

use crate::core::errors::AttrdError;
use crate::core::protocol::{Message, UpdateFields, PROTOCOL_VERSION};
use crate::core::store::AttributeStore;
use regex::Regex;

/// A single attribute name, or a POSIX-extended regex matched against
/// attribute names currently present in the local table (spec.md §4.8).
#[derive(Debug, Clone)]
pub enum NameOrRegex {
    Name(String),
    Regex(String),
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub name_or_regex: NameOrRegex,
    pub node: Option<String>,
    /// May carry a literal value, or a `"++"`/`"+=N"` expansion request
    /// (spec.md §4.3); `None` deletes.
    pub value: Option<String>,
    pub dampen_ms: Option<u64>,
    pub private: bool,
}

/// Requests a local client can submit (stand-in for the real IPC surface).
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Update(UpdateRequest),
    Query { name: String, host: Option<String> },
    ClearFailure {
        resource: Option<String>,
        operation: Option<String>,
        interval_ms: Option<u64>,
    },
    Refresh,
    PeerRemove { host: Option<String>, host_id: Option<u64> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientReply {
    Ack,
    QueryResult(Vec<(String, Option<String>)>),
    Error(String),
}

/// Builds the three failure-attribute regex patterns that are part of the
/// external contract (spec.md §6): `CLEAR_ALL`, `CLEAR_ONE(resource)`, and
/// `CLEAR_OP(resource, operation, interval_ms)`.
pub fn clear_failure_regex(
    resource: Option<&str>,
    operation: Option<&str>,
    interval_ms: Option<u64>,
) -> Result<Regex, AttrdError> {
    let pattern = match (resource, operation, interval_ms) {
        (None, _, _) => r"^(fail-count|last-failure)-.+$".to_string(),
        (Some(r), Some(op), Some(ms)) => format!(
            r"^(fail-count|last-failure)-{}-{}-{}$",
            regex::escape(r),
            regex::escape(op),
            ms
        ),
        (Some(r), _, _) => format!(r"^(fail-count|last-failure)-{}(-.+)?$", regex::escape(r)),
    };
    Regex::new(&pattern).map_err(AttrdError::from)
}

/// Expands the `"++"`/`"+=N"` increment shorthand against `current`,
/// returning the concrete value that goes on the wire (spec.md §4.3).
pub fn expand_value(current: Option<&str>, value: &str) -> String {
    let base: i64 = current.and_then(|s| s.parse().ok()).unwrap_or(0);
    if value == "++" {
        (base + 1).to_string()
    } else if let Some(delta) = value.strip_prefix("+=") {
        let delta: i64 = delta.parse().unwrap_or(0);
        (base + delta).to_string()
    } else {
        value.to_string()
    }
}

/// Implements component H.
pub struct Dispatcher {
    local_node: String,
}

impl Dispatcher {
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
        }
    }

    fn resolve_node<'a>(&'a self, node: Option<&'a str>) -> &'a str {
        node.unwrap_or(&self.local_node)
    }

    fn current_value(store: &AttributeStore, name: &str, node: &str) -> Option<String> {
        store.lookup(name).and_then(|a| a.get_value(node)).and_then(|v| v.current.clone())
    }

    fn build_update(&self, name: String, node: &str, value: Option<String>, dampen_ms: Option<u64>, private: bool) -> Message {
        let fields = UpdateFields {
            target_node: Some(node.to_string()),
            value,
            dampen_ms,
            is_private: private,
            ..UpdateFields::new(name)
        };
        if dampen_ms.is_some() {
            Message::UpdateBoth(fields)
        } else {
            Message::Update(fields)
        }
    }

    /// `update` (spec.md §4.8): one broadcast per matching attribute.
    pub fn handle_update(&self, store: &AttributeStore, req: &UpdateRequest) -> Result<Vec<Message>, AttrdError> {
        let node = self.resolve_node(req.node.as_deref()).to_string();
        match &req.name_or_regex {
            NameOrRegex::Name(name) => {
                let current = Self::current_value(store, name, &node);
                let value = req.value.as_deref().map(|v| expand_value(current.as_deref(), v));
                Ok(vec![self.build_update(name.clone(), &node, value, req.dampen_ms, req.private)])
            }
            NameOrRegex::Regex(pattern) => {
                let re = Regex::new(pattern).map_err(AttrdError::from)?;
                let names: Vec<String> = store.names().filter(|n| re.is_match(n)).map(String::from).collect();
                let mut msgs = Vec::with_capacity(names.len());
                for name in names {
                    let current = Self::current_value(store, &name, &node);
                    let value = req.value.as_deref().map(|v| expand_value(current.as_deref(), v));
                    msgs.push(self.build_update(name, &node, value, req.dampen_ms, req.private));
                }
                Ok(msgs)
            }
        }
    }

    /// `query` (spec.md §4.8): read-only, `"localhost"` aliases to the local
    /// node name.
    pub fn handle_query(&self, store: &AttributeStore, name: &str, host: Option<&str>) -> ClientReply {
        let Some(attr) = store.lookup(name) else {
            return ClientReply::Error(format!("unknown attribute '{name}'"));
        };
        let host = host.map(|h| {
            if h.eq_ignore_ascii_case("localhost") {
                self.local_node.clone()
            } else {
                h.to_string()
            }
        });
        let entries = match host {
            Some(h) => attr
                .get_value(&h)
                .map(|v| vec![(v.node_name.clone(), v.current.clone())])
                .unwrap_or_default(),
            None => attr.values().map(|v| (v.node_name.clone(), v.current.clone())).collect(),
        };
        ClientReply::QueryResult(entries)
    }

    /// `clear-failure` (spec.md §4.8): always expands locally to per-attribute
    /// deletes; additionally emits a raw `CLEAR_FAILURE` broadcast only when
    /// `propagate` is set (Open Question 1, resolved in SPEC_FULL.md §11).
    pub fn handle_clear_failure(
        &self,
        store: &AttributeStore,
        resource: Option<&str>,
        operation: Option<&str>,
        interval_ms: Option<u64>,
        propagate: bool,
    ) -> Result<Vec<Message>, AttrdError> {
        let re = clear_failure_regex(resource, operation, interval_ms)?;
        let node = self.local_node.clone();
        let mut msgs: Vec<Message> = store
            .names()
            .filter(|n| re.is_match(n))
            .map(|n| self.build_update(n.to_string(), &node, None, None, false))
            .collect();
        if propagate {
            msgs.push(Message::ClearFailure {
                resource: resource.map(String::from),
                operation: operation.map(String::from),
                interval_ms,
            });
        }
        Ok(msgs)
    }

    /// `peer-remove` (spec.md §4.8): resolves a bare id to a name via the
    /// supplied peer-cache lookup before broadcasting.
    pub fn handle_peer_remove(
        &self,
        host: Option<&str>,
        host_id: Option<u64>,
        resolve_id: impl Fn(u64) -> Option<String>,
    ) -> Result<Message, AttrdError> {
        let node = match (host, host_id) {
            (Some(h), _) => h.to_string(),
            (None, Some(id)) => {
                resolve_id(id).ok_or_else(|| AttrdError::UnknownPeer(format!("id {id}")))?
            }
            (None, None) => {
                return Err(AttrdError::Internal("peer-remove requires a host or host_id".into()));
            }
        };
        Ok(Message::PeerRemove { node, node_id: host_id.unwrap_or(0) })
    }

    /// The private `#attrd-protocol` attribute emitted at daemon start so
    /// peers can compute the minimum supported protocol version (spec.md
    /// §4.8, last paragraph).
    pub fn protocol_attribute_update(&self) -> Message {
        self.build_update(
            "#attrd-protocol".to_string(),
            &self.local_node,
            Some(PROTOCOL_VERSION.to_string()),
            None,
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::AttributeProto;

    #[test]
    fn increment_expansion_uses_current_local_value_as_base() {
        let mut store = AttributeStore::new();
        store.get_or_create("fail-count-web", &AttributeProto::default()).get_or_create_value("n1").current =
            Some("3".into());
        let dispatcher = Dispatcher::new("n1");
        let req = UpdateRequest {
            name_or_regex: NameOrRegex::Name("fail-count-web".into()),
            node: None,
            value: Some("++".into()),
            dampen_ms: None,
            private: false,
        };
        let msgs = dispatcher.handle_update(&store, &req).unwrap();
        match &msgs[0] {
            Message::Update(f) => assert_eq!(f.value, Some("4".into())),
            _ => panic!("expected Update"),
        }
    }

    #[test]
    fn regex_update_emits_one_broadcast_per_match() {
        let mut store = AttributeStore::new();
        for name in ["fail-count-web", "fail-count-db"] {
            store.get_or_create(name, &AttributeProto::default());
        }
        let dispatcher = Dispatcher::new("n1");
        let req = UpdateRequest {
            name_or_regex: NameOrRegex::Regex("^fail-count-.*$".into()),
            node: None,
            value: Some("1".into()),
            dampen_ms: None,
            private: false,
        };
        let msgs = dispatcher.handle_update(&store, &req).unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn query_resolves_localhost_alias() {
        let mut store = AttributeStore::new();
        store.get_or_create("shoe-size", &AttributeProto::default()).get_or_create_value("n1").current =
            Some("42".into());
        let dispatcher = Dispatcher::new("n1");
        let reply = dispatcher.handle_query(&store, "shoe-size", Some("localhost"));
        assert_eq!(reply, ClientReply::QueryResult(vec![("n1".to_string(), Some("42".into()))]));
    }

    #[test]
    fn clear_failure_without_propagate_emits_only_local_deletes() {
        let mut store = AttributeStore::new();
        store.get_or_create("fail-count-web", &AttributeProto::default());
        let dispatcher = Dispatcher::new("n1");
        let msgs = dispatcher.handle_clear_failure(&store, Some("web"), None, None, false).unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], Message::Update(_)));
    }

    #[test]
    fn clear_failure_with_propagate_also_emits_raw_op() {
        let store = AttributeStore::new();
        let dispatcher = Dispatcher::new("n1");
        let msgs = dispatcher.handle_clear_failure(&store, None, None, None, true).unwrap();
        assert!(msgs.iter().any(|m| matches!(m, Message::ClearFailure { .. })));
    }

    #[test]
    fn clear_one_matches_dash_separated_failure_attributes_only() {
        let re = clear_failure_regex(Some("web"), None, None).unwrap();
        assert!(re.is_match("fail-count-web-start-0"));
        assert!(re.is_match("last-failure-web-start-0"));
        assert!(!re.is_match("fail-count-db-start-0"));
    }

    #[test]
    fn clear_op_matches_exact_resource_operation_interval() {
        let re = clear_failure_regex(Some("web"), Some("start"), Some(0)).unwrap();
        assert!(re.is_match("fail-count-web-start-0"));
        assert!(!re.is_match("fail-count-web-monitor-10000"));
    }

    #[test]
    fn peer_remove_resolves_bare_id_via_callback() {
        let dispatcher = Dispatcher::new("n1");
        let msg = dispatcher.handle_peer_remove(None, Some(7), |id| if id == 7 { Some("n2".into()) } else { None }).unwrap();
        assert_eq!(msg, Message::PeerRemove { node: "n2".into(), node_id: 7 });
    }
}
