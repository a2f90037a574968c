// tests/scenarios.rs
//
// End-to-end scenarios driven entirely through the daemon's public surface:
// client requests over `DaemonHandles::client_tx`, membership deltas over
// `membership_tx`, and the `InMemoryTransport`/`InMemoryCdb` fakes. No
// private daemon state is touched directly, mirroring how the teacher's own
// cluster/replication integration tests drive behavior through channels
// rather than internals.

use attrd::core::cdb::{CdbBehavior, InMemoryCdb};
use attrd::core::daemon::{Daemon, DaemonHandles};
use attrd::core::dispatcher::{ClientReply, ClientRequest, NameOrRegex, UpdateRequest};
use attrd::core::election::BullyElection;
use attrd::core::membership::MembershipEvent;
use attrd::core::protocol::{Envelope, Message, SyncRecord};
use attrd::core::transport::{InMemoryTransport, Transport};
use attrd::AttrdError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

type TestDaemon = Daemon<InMemoryTransport, InMemoryCdb, BullyElection>;

/// A spawned daemon plus everything a test needs to poke at it from the
/// outside.
struct Node {
    handles: DaemonHandles,
    cdb: Arc<InMemoryCdb>,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<Result<(), AttrdError>>,
}

impl Node {
    async fn request(&self, req: ClientRequest) -> ClientReply {
        let (tx, rx) = oneshot::channel();
        self.handles
            .client_tx
            .send((req, tx))
            .await
            .expect("daemon task still alive");
        rx.await.expect("daemon replied")
    }

    async fn update(&self, name: &str, node: &str, value: Option<&str>, dampen_ms: Option<u64>) -> ClientReply {
        self.request(ClientRequest::Update(UpdateRequest {
            name_or_regex: NameOrRegex::Name(name.to_string()),
            node: Some(node.to_string()),
            value: value.map(String::from),
            dampen_ms,
            private: false,
        }))
        .await
    }

    async fn query(&self, name: &str, host: &str) -> ClientReply {
        self.request(ClientRequest::Query { name: name.to_string(), host: Some(host.to_string()) })
            .await
    }

    async fn clear_failure(&self, resource: &str) -> ClientReply {
        self.request(ClientRequest::ClearFailure {
            resource: Some(resource.to_string()),
            operation: None,
            interval_ms: None,
        })
        .await
    }

    async fn notify_membership(&self, event: MembershipEvent) {
        self.handles.membership_tx.send(event).await.expect("daemon task still alive");
    }

    #[allow(dead_code)]
    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

fn two_node_network(a: &str, b: &str) -> HashMap<String, InMemoryTransport> {
    InMemoryTransport::new_network(&[a, b], 64)
}

/// Spawns a daemon for `node`, preloading its election gate with `voters` —
/// standing in for a cluster membership layer that already knows every
/// member's numeric id by the time this daemon starts (spec.md §4.4).
fn spawn_node(node: &str, node_id: u64, voters: &[(&str, u64)], net: &mut HashMap<String, InMemoryTransport>) -> Node {
    let transport = net.remove(node).expect("node present in the network");
    let (cdb_tx, cdb_rx) = mpsc::channel(64);
    let cdb = Arc::new(InMemoryCdb::new(cdb_tx));
    let mut election = BullyElection::new(node, node_id);
    for (peer, id) in voters {
        election.add_voter(peer, *id);
    }
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (daemon, handles): (TestDaemon, DaemonHandles) = Daemon::new(
        node,
        false,
        Duration::from_secs(2),
        cdb.clone(),
        cdb_rx,
        election,
        transport,
        shutdown_rx,
        0,
    );
    let join = tokio::spawn(daemon.run());
    Node { handles, cdb, shutdown_tx, join }
}

/// Gives spawned daemon tasks a chance to drain their channels and finish
/// any in-flight async work before assertions run.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// Scenario 1 (spec.md §8.1): simple update, two daemons, N1 writer.
#[tokio::test]
async fn scenario_simple_update_replicates_and_persists_once() {
    let mut net = two_node_network("n1", "n2");
    let n1 = spawn_node("n1", 1, &[("n2", 2)], &mut net);
    let n2 = spawn_node("n2", 2, &[("n1", 1)], &mut net);
    settle().await;

    n1.notify_membership(MembershipEvent::NameLearned {
        node: "n1".to_string(),
        node_id: 1,
        uuid: Some("uuid-n1".to_string()),
    })
    .await;
    settle().await;

    assert!(matches!(n1.update("shoe-size", "n1", Some("42"), None).await, ClientReply::Ack));
    settle().await;

    match n1.query("shoe-size", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), Some("42".to_string()))]),
        other => panic!("unexpected reply: {other:?}"),
    }
    match n2.query("shoe-size", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), Some("42".to_string()))]),
        other => panic!("n2 did not converge: {other:?}"),
    }

    let trees = n1.cdb.submitted_trees();
    assert_eq!(trees.len(), 1);
    let (_, tree) = &trees[0];
    assert_eq!(tree.node_states.len(), 1);
    assert_eq!(tree.node_states[0].id, "uuid-n1");
    let nvpair = &tree.node_states[0].transient_attrs.attr_sets[0].nvpairs[0];
    assert_eq!(nvpair.name, "shoe-size");
    assert_eq!(nvpair.value, Some("42".to_string()));

    // N2 never believes itself the writer, so it never persists.
    assert!(n2.cdb.submitted_trees().is_empty());
}

// Scenario 2 (spec.md §8.2): dampening coalesces rapid updates into one
// write of the final value.
#[tokio::test(start_paused = true)]
async fn scenario_dampening_coalesces_rapid_updates_into_one_write() {
    let mut net = InMemoryTransport::new_network(&["n1"], 16);
    let n1 = spawn_node("n1", 1, &[], &mut net);
    settle().await;

    n1.notify_membership(MembershipEvent::NameLearned {
        node: "n1".to_string(),
        node_id: 1,
        uuid: Some("uuid-n1".to_string()),
    })
    .await;
    settle().await;

    assert!(matches!(n1.update("load", "n1", Some("1"), Some(500)).await, ClientReply::Ack));
    tokio::time::advance(Duration::from_millis(30)).await;
    settle().await;
    assert!(matches!(n1.update("load", "n1", Some("2"), None).await, ClientReply::Ack));
    tokio::time::advance(Duration::from_millis(30)).await;
    settle().await;
    assert!(matches!(n1.update("load", "n1", Some("3"), None).await, ClientReply::Ack));
    settle().await;

    // Nothing has been written yet: each update restarted the 500ms timer.
    assert!(n1.cdb.submitted_trees().is_empty());

    tokio::time::advance(Duration::from_millis(520)).await;
    settle().await;

    let trees = n1.cdb.submitted_trees();
    assert_eq!(trees.len(), 1, "dampening must coalesce into exactly one write");
    let nvpair = &trees[0].1.node_states[0].transient_attrs.attr_sets[0].nvpairs[0];
    assert_eq!(nvpair.value, Some("3".to_string()));
}

// Scenario 3 (spec.md §8.3): the local-owner veto. A peer's SYNC_RESPONSE
// claiming a stale value for our own node must never overwrite it, and we
// must restate the correct value.
#[tokio::test]
async fn scenario_local_owner_veto_restates_value_on_sync() {
    let mut net = two_node_network("n1", "n2");
    let mut n2_transport = net.remove("n2").expect("n2 endpoint present");
    let n1 = spawn_node("n1", 1, &[], &mut net);
    settle().await;

    n1.notify_membership(MembershipEvent::NameLearned {
        node: "n1".to_string(),
        node_id: 1,
        uuid: Some("uuid-n1".to_string()),
    })
    .await;
    assert!(matches!(n1.update("shoe-size", "n1", Some("alive"), None).await, ClientReply::Ack));
    settle().await;

    let stale_sync = Envelope::new(
        "n2",
        None,
        Message::SyncResponse(vec![SyncRecord {
            name: "shoe-size".to_string(),
            set_id: None,
            key_id: None,
            identity: None,
            node: "n1".to_string(),
            node_id: 0,
            value: Some("dead".to_string()),
            dampen_ms: 0,
            is_private: false,
            is_remote: false,
        }]),
    );
    n2_transport.send_to("n1", stale_sync).await.expect("n1 still reachable");
    settle().await;

    match n1.query("shoe-size", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), Some("alive".to_string()))]),
        other => panic!("local value was overwritten: {other:?}"),
    }

    // N1 must have restated its own value back over the wire, somewhere
    // among the startup chatter (protocol attribute, initial writer sync,
    // the plain update broadcast) that preceded it.
    let correction = find_sync_response_for(&mut n2_transport, "shoe-size").await;
    assert_eq!(correction.value, Some("alive".to_string()));
}

/// Drains `transport` until it finds a `SyncResponse` record for `name`,
/// skipping any other traffic (startup chatter, plain `Update`s) ahead of it.
async fn find_sync_response_for(transport: &mut InMemoryTransport, name: &str) -> SyncRecord {
    for _ in 0..20 {
        let (_, envelope) = transport.recv().await.expect("n1 still broadcasting");
        if let Message::SyncResponse(records) = envelope.body {
            if let Some(rec) = records.into_iter().find(|r| r.name == name) {
                return rec;
            }
        }
    }
    panic!("no SyncResponse for '{name}' observed");
}

// Scenario 4 (spec.md §8.4): writer election on join, followed by a full
// snapshot to the newly joined peer.
#[tokio::test]
async fn scenario_writer_election_then_full_snapshot_on_join() {
    let mut net = two_node_network("n1", "n2");
    let n1 = spawn_node("n1", 1, &[("n2", 2)], &mut net);
    let n2 = spawn_node("n2", 2, &[("n1", 1)], &mut net);
    settle().await;

    // Lowest id wins: N1 is writer, N2 is not, and N1 has written nothing
    // beyond its own private protocol attribute.
    assert!(n1.cdb.submitted_trees().is_empty());
    assert!(n2.cdb.submitted_trees().is_empty());

    n1.notify_membership(MembershipEvent::NameLearned {
        node: "n1".to_string(),
        node_id: 1,
        uuid: Some("uuid-n1".to_string()),
    })
    .await;
    assert!(matches!(n1.update("shoe-size", "n1", Some("42"), None).await, ClientReply::Ack));
    settle().await;

    n1.notify_membership(MembershipEvent::StateChanged { node: "n2".to_string(), member: true, is_remote: false })
        .await;
    settle().await;

    match n2.query("shoe-size", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), Some("42".to_string()))]),
        other => panic!("n2 did not receive the full snapshot: {other:?}"),
    }
    assert!(n2.cdb.submitted_trees().is_empty(), "a non-writer never persists");
}

// Scenario 5 (spec.md §8.5): retry on failed write. A retryable CDB error
// arms a 2-second failure backoff; the retry succeeds and the timer clears.
#[tokio::test(start_paused = true)]
async fn scenario_retry_after_failed_write_then_succeeds() {
    let mut net = InMemoryTransport::new_network(&["n1"], 16);
    let n1 = spawn_node("n1", 1, &[], &mut net);
    settle().await;

    n1.notify_membership(MembershipEvent::NameLearned {
        node: "n1".to_string(),
        node_id: 1,
        uuid: Some("uuid-n1".to_string()),
    })
    .await;
    settle().await;

    n1.cdb.set_behavior(CdbBehavior::FailThenOk { remaining_failures: 1 });
    assert!(matches!(n1.update("x", "n1", Some("1"), None).await, ClientReply::Ack));
    settle().await;

    assert_eq!(n1.cdb.submitted_trees().len(), 1, "first attempt submitted and failed");

    tokio::time::advance(Duration::from_millis(2100)).await;
    settle().await;

    let trees = n1.cdb.submitted_trees();
    assert_eq!(trees.len(), 2, "exactly one retry after the backoff elapses");
    let nvpair = &trees[1].1.node_states[0].transient_attrs.attr_sets[0].nvpairs[0];
    assert_eq!(nvpair.value, Some("1".to_string()));

    // No further retries: the backoff timer was cleared on success.
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(n1.cdb.submitted_trees().len(), 2);
}

// Scenario 6 (spec.md §8.6): clear-failure by regex only touches matching
// attributes.
#[tokio::test]
async fn scenario_clear_failure_by_regex_only_clears_matching_resource() {
    let mut net = InMemoryTransport::new_network(&["n1"], 16);
    let n1 = spawn_node("n1", 1, &[], &mut net);
    settle().await;

    n1.notify_membership(MembershipEvent::NameLearned {
        node: "n1".to_string(),
        node_id: 1,
        uuid: Some("uuid-n1".to_string()),
    })
    .await;
    settle().await;

    for name in ["fail-count-web-start-0", "fail-count-db-start-0", "last-failure-web-start-0"] {
        assert!(matches!(n1.update(name, "n1", Some("1"), None).await, ClientReply::Ack));
    }
    settle().await;
    let writes_before = n1.cdb.submitted_trees().len();

    assert!(matches!(n1.clear_failure("web").await, ClientReply::Ack));
    settle().await;

    match n1.query("fail-count-web-start-0", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), None)]),
        other => panic!("web attribute was not cleared: {other:?}"),
    }
    match n1.query("last-failure-web-start-0", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), None)]),
        other => panic!("web attribute was not cleared: {other:?}"),
    }
    match n1.query("fail-count-db-start-0", "n1").await {
        ClientReply::QueryResult(entries) => assert_eq!(entries, vec![("n1".to_string(), Some("1".to_string()))]),
        other => panic!("unrelated db attribute must be untouched: {other:?}"),
    }

    let writes_after = n1.cdb.submitted_trees().len();
    assert_eq!(writes_after - writes_before, 2, "one delete write per matching attribute");
    for (_, tree) in n1.cdb.submitted_trees().iter().skip(writes_before) {
        assert!(tree.is_mixed_update, "a delete batch must be marked as a mixed update");
    }
}
