// src/core/cdb.rs

//! The configuration database (CDB) client seam (spec.md §1, §6). The real
//! CDB client is an opaque asynchronous request/callback transport that
//! accepts an XML-like tree and reports success/failure; this module models
//! that contract as a `CdbClient` trait plus one `InMemoryCdb` fake that
//! stores submitted trees and can be configured to fail or delay.

use crate::core::errors::AttrdError;
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// One `NVPAIR` leaf: a name/value pair, or a delete if `value` is `None`
/// (spec.md §6's CDB payload shape).
#[derive(Debug, Clone, PartialEq)]
pub struct NvPair {
    pub id: String,
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttrSet {
    pub id: String,
    pub nvpairs: Vec<NvPair>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransientNodeAttrs {
    pub id: String,
    pub attr_sets: Vec<AttrSet>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeState {
    pub id: String,
    pub transient_attrs: TransientNodeAttrs,
}

/// The full `STATUS` tree submitted for one attribute-level write. Multiple
/// peers' updates are batched under one tree (spec.md §6).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusTree {
    pub node_states: Vec<NodeState>,
    /// Set when at least one `NvPair` in this batch is a delete, per the
    /// "mixed update" compatibility rule in spec.md §9.
    pub is_mixed_update: bool,
}

impl StatusTree {
    pub fn single_attribute(
        peer_uuid: &str,
        attr_set_id: &str,
        nvpair: NvPair,
    ) -> Self {
        let is_delete = nvpair.value.is_none();
        Self {
            node_states: vec![NodeState {
                id: peer_uuid.to_string(),
                transient_attrs: TransientNodeAttrs {
                    id: peer_uuid.to_string(),
                    attr_sets: vec![AttrSet {
                        id: attr_set_id.to_string(),
                        nvpairs: vec![nvpair],
                    }],
                },
            }],
            is_mixed_update: is_delete,
        }
    }
}

pub type CdbTag = u64;

/// Outcome of a submitted CDB write, delivered asynchronously via the
/// callback channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CdbResult {
    Ok,
    /// A retryable failure kind (diff-apply, election-in-progress, CDB
    /// desync per spec.md §7).
    Retryable(String),
    /// Loss of the CDB connection; surfaced upward, not retried locally.
    Fatal(String),
}

/// An opaque asynchronous request/callback transport accepting a
/// [`StatusTree`] and eventually reporting a [`CdbResult`] tagged with the
/// [`CdbTag`] returned from `submit`.
#[async_trait]
pub trait CdbClient: Send + Sync {
    async fn submit(&self, tree: StatusTree) -> Result<CdbTag, AttrdError>;
}

#[derive(Debug, Clone)]
pub enum CdbBehavior {
    AlwaysOk,
    AlwaysFail(String),
    /// Fails the next `remaining_failures` submissions, then succeeds.
    FailThenOk { remaining_failures: u32 },
}

/// An in-memory `CdbClient` fake. Not a real Pacemaker CIB client: it keeps
/// every submitted tree in memory and answers according to a configurable
/// [`CdbBehavior`], optionally after `reply_delay`.
pub struct InMemoryCdb {
    next_tag: AtomicU64,
    callback_tx: mpsc::Sender<(CdbTag, CdbResult)>,
    behavior: Mutex<CdbBehavior>,
    reply_delay: Duration,
    submitted: Mutex<Vec<(CdbTag, StatusTree)>>,
}

impl InMemoryCdb {
    pub fn new(callback_tx: mpsc::Sender<(CdbTag, CdbResult)>) -> Self {
        Self {
            next_tag: AtomicU64::new(1),
            callback_tx,
            behavior: Mutex::new(CdbBehavior::AlwaysOk),
            reply_delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: CdbBehavior) -> Self {
        self.behavior = Mutex::new(behavior);
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn set_behavior(&self, behavior: CdbBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn submitted_trees(&self) -> Vec<(CdbTag, StatusTree)> {
        self.submitted.lock().unwrap().clone()
    }

    fn next_result(&self) -> CdbResult {
        let mut behavior = self.behavior.lock().unwrap();
        match &mut *behavior {
            CdbBehavior::AlwaysOk => CdbResult::Ok,
            CdbBehavior::AlwaysFail(reason) => CdbResult::Retryable(reason.clone()),
            CdbBehavior::FailThenOk { remaining_failures } => {
                if *remaining_failures > 0 {
                    *remaining_failures -= 1;
                    CdbResult::Retryable("simulated transient failure".to_string())
                } else {
                    CdbResult::Ok
                }
            }
        }
    }
}

#[async_trait]
impl CdbClient for InMemoryCdb {
    async fn submit(&self, tree: StatusTree) -> Result<CdbTag, AttrdError> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push((tag, tree));
        let result = self.next_result();
        let tx = self.callback_tx.clone();
        let delay = self.reply_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send((tag, result)).await;
        });
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_stores_tree_and_acks_ok_by_default() {
        let (tx, mut rx) = mpsc::channel(8);
        let cdb = InMemoryCdb::new(tx);
        let tree = StatusTree::single_attribute(
            "uuid-1",
            "status-uuid-1",
            NvPair { id: "nv-1".into(), name: "shoe-size".into(), value: Some("42".into()) },
        );
        let tag = cdb.submit(tree.clone()).await.unwrap();
        let (cb_tag, result) = rx.recv().await.unwrap();
        assert_eq!(cb_tag, tag);
        assert_eq!(result, CdbResult::Ok);
        assert_eq!(cdb.submitted_trees(), vec![(tag, tree)]);
    }

    #[tokio::test]
    async fn fail_then_ok_behavior_retries_then_succeeds() {
        let (tx, mut rx) = mpsc::channel(8);
        let cdb = InMemoryCdb::new(tx).with_behavior(CdbBehavior::FailThenOk { remaining_failures: 1 });
        let tree = StatusTree::default();
        cdb.submit(tree.clone()).await.unwrap();
        let (_, first) = rx.recv().await.unwrap();
        assert!(matches!(first, CdbResult::Retryable(_)));
        cdb.submit(tree).await.unwrap();
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(second, CdbResult::Ok);
    }

    #[test]
    fn delete_value_marks_batch_as_mixed_update() {
        let tree = StatusTree::single_attribute(
            "uuid-1",
            "status-uuid-1",
            NvPair { id: "nv-1".into(), name: "fail-count-web".into(), value: None },
        );
        assert!(tree.is_mixed_update);
    }
}
