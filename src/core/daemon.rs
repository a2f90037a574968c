// src/core/daemon.rs

//! The event loop that owns every component's state and ties them together
//! (spec.md §5). One task owns the `AttributeStore` and all component state
//! by `&mut` reference; every other task communicates with it exclusively
//! through channels, mirroring how the teacher's `AofWriterTask` and
//! `ReplicaWorker` each own their state behind one `tokio::select!` loop.

use crate::core::cdb::{CdbClient, CdbResult, CdbTag};
use crate::core::dispatcher::{ClientReply, ClientRequest, Dispatcher, UpdateRequest};
use crate::core::election::ElectionGate;
use crate::core::errors::AttrdError;
use crate::core::membership::{MembershipEvent, MembershipReactor};
use crate::core::model::TimerState;
use crate::core::protocol::{ElectionOp, Envelope, Message, QueryReplyEntry};
use crate::core::replication::{PeerUpdateEffects, ReplicationEngine, UpdateOp};
use crate::core::store::AttributeStore;
use crate::core::timers::{TimerDriver, TimerFired};
use crate::core::transport::Transport;
use crate::core::writer::{WriteCallbackAction, Writer};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Channels a [`Daemon`] is fed through; the matching senders are handed out
/// to the tasks that originate each kind of event (transport receiver loop
/// lives inside the daemon itself since `Transport::recv` is polled
/// directly; the timer channel is purely internal to `TimerDriver`). The CDB
/// callback channel is not here: its sender must exist before the `CdbClient`
/// itself is constructed, so the caller creates that channel and passes the
/// receiver half into [`Daemon::new`] directly.
pub struct DaemonHandles {
    pub membership_tx: mpsc::Sender<MembershipEvent>,
    pub client_tx: mpsc::Sender<(ClientRequest, oneshot::Sender<ClientReply>)>,
}

struct DaemonChannels {
    timer_rx: mpsc::Receiver<TimerFired>,
    cdb_rx: mpsc::Receiver<(CdbTag, CdbResult)>,
    membership_rx: mpsc::Receiver<MembershipEvent>,
    client_rx: mpsc::Receiver<(ClientRequest, oneshot::Sender<ClientReply>)>,
}

/// Single-actor daemon core (components A-H assembled). `T` is the cluster
/// transport, `C` the CDB client, `E` the election gate — all three are
/// out-of-scope external collaborators (spec.md §1) represented here by
/// trait objects bound at construction (SPEC_FULL.md §6).
pub struct Daemon<T: Transport, C: CdbClient, E: ElectionGate> {
    local_node: String,
    propagate_clear_failure_to_peers: bool,
    failure_backoff: Duration,

    store: AttributeStore,
    timers: TimerDriver,
    writer: Writer<C>,
    election: E,
    replication: ReplicationEngine,
    membership: MembershipReactor,
    dispatcher: Dispatcher,
    transport: T,

    channels: DaemonChannels,
    shutdown_rx: broadcast::Receiver<()>,
    shutting_down: bool,
}

impl<T: Transport, C: CdbClient, E: ElectionGate> Daemon<T, C, E> {
    /// `cdb` and `cdb_rx` must share the same callback channel: the caller
    /// creates that channel, builds the `CdbClient` with its sender, and
    /// passes both the client and the receiver half in here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_node: impl Into<String>,
        propagate_clear_failure_to_peers: bool,
        failure_backoff: Duration,
        cdb: std::sync::Arc<C>,
        cdb_rx: mpsc::Receiver<(CdbTag, CdbResult)>,
        election: E,
        transport: T,
        shutdown_rx: broadcast::Receiver<()>,
        default_dampen_ms: u64,
    ) -> (Self, DaemonHandles) {
        let local_node = local_node.into();
        let (timer_tx, timer_rx) = mpsc::channel(256);
        let (membership_tx, membership_rx) = mpsc::channel(64);
        let (client_tx, client_rx) = mpsc::channel(256);

        let daemon = Self {
            dispatcher: Dispatcher::new(local_node.clone()),
            replication: ReplicationEngine::new(local_node.clone()).with_default_dampen_ms(default_dampen_ms),
            membership: MembershipReactor::new(),
            store: AttributeStore::new(),
            timers: TimerDriver::new(timer_tx),
            writer: Writer::new(cdb),
            election,
            transport,
            local_node,
            propagate_clear_failure_to_peers,
            failure_backoff,
            channels: DaemonChannels { timer_rx, cdb_rx, membership_rx, client_rx },
            shutdown_rx,
            shutting_down: false,
        };
        let handles = DaemonHandles { membership_tx, client_tx };
        (daemon, handles)
    }

    fn envelope(&self, body: Message) -> Envelope {
        let writer_id = if self.election.election_won() {
            Some(self.local_node.clone())
        } else {
            None
        };
        Envelope::new(self.local_node.clone(), writer_id, body)
    }

    async fn broadcast(&mut self, body: Message) -> Result<(), AttrdError> {
        let env = self.envelope(body);
        if matches!(env.body, Message::ClearFailure { .. }) {
            return self.broadcast_gated(env).await;
        }
        self.transport.broadcast(env).await
    }

    /// Broadcasts an envelope that not every peer's advertised protocol
    /// version supports (spec.md §6: a v1 peer is never sent `CLEAR_FAILURE`,
    /// SPEC_FULL.md §10). Sent peer-by-peer instead of via the transport's
    /// blanket `broadcast` so each recipient's version can be checked first.
    async fn broadcast_gated(&mut self, env: Envelope) -> Result<(), AttrdError> {
        let local = self.local_node.to_ascii_lowercase();
        let peers: Vec<String> = self.writer.known_peer_names().map(String::from).collect();
        for peer in peers {
            if peer == local {
                continue;
            }
            if !env.supported_by(self.membership.peer_version(&peer)) {
                tracing::debug!(peer = %peer, "withholding unsupported op from v1 peer");
                continue;
            }
            self.transport.send_to(&peer, env.clone()).await?;
        }
        Ok(())
    }

    async fn send_to(&mut self, peer: &str, body: Message) -> Result<(), AttrdError> {
        let env = self.envelope(body);
        self.transport.send_to(peer, env).await
    }

    /// Runs once at startup: emits the `#attrd-protocol` marker and attempts
    /// to become writer if alone (spec.md §8 scenario 4).
    pub async fn startup(&mut self) -> Result<(), AttrdError> {
        let proto_update = self.dispatcher.protocol_attribute_update();
        self.broadcast(proto_update.clone()).await?;
        if let Message::Update(fields) = proto_update {
            let target = self.local_node.clone();
            let effects = self.replication.peer_update(&mut self.store, UpdateOp::Update, &fields, Some(target.as_str()), false)?;
            self.apply_effects(effects).await?;
        }
        self.election.election_start_if_needed();
        if self.election.election_won() {
            self.on_election_won().await?;
        }
        Ok(())
    }

    async fn on_election_won(&mut self) -> Result<(), AttrdError> {
        tracing::info!(node = %self.local_node, "won election, becoming writer");
        let snapshot = self.replication.peer_sync(&self.store);
        self.broadcast(snapshot).await?;
        self.writer.write_all(&mut self.store, &mut self.timers, false, false).await?;
        Ok(())
    }

    async fn write_or_elect(&mut self, name: &str, ignore_delay: bool) -> Result<(), AttrdError> {
        if self.election.election_won() {
            return self.writer.write(&mut self.store, &mut self.timers, name, ignore_delay).await;
        }
        self.election.election_start_if_needed();
        if self.election.election_won() {
            self.on_election_won().await?;
        }
        Ok(())
    }

    fn start_dampening_timer(&mut self, name: &str) {
        let Some(attr) = self.store.lookup_mut(name) else { return };
        let dampen_ms = attr.dampen_ms;
        let generation = attr.timer.map(|t| t.generation + 1).unwrap_or(1);
        attr.timer = Some(TimerState { generation, is_backoff: false });
        self.timers.start(name, Duration::from_millis(dampen_ms), generation, false);
    }

    fn start_failure_backoff(&mut self, name: &str) {
        let Some(attr) = self.store.lookup_mut(name) else { return };
        let generation = attr.timer.map(|t| t.generation + 1).unwrap_or(1);
        attr.timer = Some(TimerState { generation, is_backoff: true });
        self.timers.start(name, self.failure_backoff, generation, true);
    }

    async fn on_dampen_changed(&mut self, name: &str) -> Result<(), AttrdError> {
        let dampen_ms = match self.store.lookup(name) {
            Some(a) => a.dampen_ms,
            None => return Ok(()),
        };
        if dampen_ms > 0 {
            self.start_dampening_timer(name);
        } else {
            self.timers.cancel(name);
            if let Some(a) = self.store.lookup_mut(name) {
                a.timer = None;
            }
        }
        self.write_or_elect(name, false).await
    }

    /// Applies the side effects of one `peer_update` call (spec.md §4.5,
    /// §4.6 step 10).
    async fn apply_effects(&mut self, effects: PeerUpdateEffects) -> Result<(), AttrdError> {
        for msg in effects.broadcast {
            self.broadcast(msg).await?;
        }
        if let Some((node, node_id)) = effects.learned_peer {
            self.writer.register_peer(&node, node_id, None);
            if self.election.election_won() {
                self.writer.write_all(&mut self.store, &mut self.timers, true, false).await?;
            }
        }
        if effects.dampen_changed {
            self.on_dampen_changed(&effects.attr_name).await?;
        } else if effects.start_timer {
            self.start_dampening_timer(&effects.attr_name);
        } else if effects.needs_write_or_elect {
            self.write_or_elect(&effects.attr_name, false).await?;
        }
        Ok(())
    }

    async fn apply_effects_batch(&mut self, batch: Vec<PeerUpdateEffects>) -> Result<(), AttrdError> {
        for effects in batch {
            self.apply_effects(effects).await?;
        }
        Ok(())
    }

    async fn apply_peer_update(
        &mut self,
        op: UpdateOp,
        fields: crate::core::protocol::UpdateFields,
        from: &str,
    ) -> Result<(), AttrdError> {
        let target = fields.target_node.clone();
        let name = fields.name.clone();
        let effects = self.replication.peer_update(&mut self.store, op, &fields, target.as_deref(), false)?;
        if name == "#attrd-protocol" {
            let value = self.store.lookup(&name).and_then(|a| a.get_value(from)).and_then(|v| v.current.clone());
            self.membership.observe_protocol_attribute(from, value.as_deref());
        }
        self.apply_effects(effects).await
    }

    async fn on_inbound(&mut self, from: String, envelope: Envelope) -> Result<(), AttrdError> {
        if self.shutting_down && !matches!(envelope.body, Message::Election(_)) {
            tracing::debug!(from = %from, "shutting down: dropping non-election message");
            return Ok(());
        }
        match envelope.body {
            Message::Update(fields) => self.apply_peer_update(UpdateOp::Update, fields, &from).await?,
            Message::UpdateDelay(fields) => self.apply_peer_update(UpdateOp::UpdateDelay, fields, &from).await?,
            Message::UpdateBoth(fields) => self.apply_peer_update(UpdateOp::UpdateBoth, fields, &from).await?,
            Message::PeerRemove { node, .. } => {
                self.replication.handle_peer_remove(&mut self.store, &node);
                self.writer.forget_peer(&node);
                self.election.remove_voter(&node);
            }
            Message::ClearFailure { resource, operation, interval_ms } => {
                let batch = self.replication.handle_clear_failure(
                    &mut self.store,
                    resource.as_deref(),
                    operation.as_deref(),
                    interval_ms,
                )?;
                self.apply_effects_batch(batch).await?;
            }
            Message::Sync => {
                let reply = self.replication.peer_sync(&self.store);
                self.send_to(&from, reply).await?;
            }
            Message::SyncResponse(records) => {
                let is_new_writer = self.replication.observe_writer_id(envelope.writer_id.as_deref());
                let effects = self.replication.handle_sync_response(&mut self.store, &records, is_new_writer)?;
                for msg in effects.broadcast {
                    self.broadcast(msg).await?;
                }
                self.apply_effects_batch(effects.per_attribute).await?;
            }
            Message::Query { name, host } => {
                let reply = self.dispatcher.handle_query(&self.store, &name, host.as_deref());
                let entries = match reply {
                    ClientReply::QueryResult(entries) => entries,
                    ClientReply::Error(reason) => {
                        tracing::warn!(attribute = %name, reason, "query for unknown attribute");
                        Vec::new()
                    }
                    ClientReply::Ack => Vec::new(),
                };
                let wire_entries = entries
                    .into_iter()
                    .map(|(host, value)| QueryReplyEntry { host, value })
                    .collect();
                self.send_to(&from, Message::QueryReply { name, entries: wire_entries }).await?;
            }
            Message::QueryReply { .. } => {
                tracing::debug!(from = %from, "ignoring unsolicited QUERY_REPLY");
            }
            Message::Election(ElectionOp::Winner { epoch, node }) => {
                self.election.declare_winner(&node, epoch);
            }
            Message::Election(_) => {
                // Vote/Count sub-ops are handled internally by this build's
                // synchronous BullyElection and never need to cross the wire.
            }
        }
        Ok(())
    }

    async fn on_timer_fired(&mut self, fired: TimerFired) -> Result<(), AttrdError> {
        let current_generation = self.store.lookup(&fired.name).and_then(|a| a.timer).map(|t| t.generation);
        if current_generation != Some(fired.generation) {
            tracing::debug!(attribute = %fired.name, "ignoring stale timer fire");
            return Ok(());
        }
        if let Some(attr) = self.store.lookup_mut(&fired.name) {
            attr.force_write = attr.force_write || fired.is_backoff;
        }
        self.write_or_elect(&fired.name, true).await
    }

    async fn on_cdb_callback(&mut self, tag: CdbTag, result: CdbResult) -> Result<(), AttrdError> {
        let is_writer = self.election.election_won();
        let (name, action) = self
            .writer
            .handle_callback(&mut self.store, &mut self.timers, tag, result, is_writer)?;
        let Some(name) = name else {
            return Ok(());
        };
        match action {
            WriteCallbackAction::None => {}
            WriteCallbackAction::RewriteNow => {
                self.writer.write(&mut self.store, &mut self.timers, &name, false).await?;
            }
            WriteCallbackAction::ArmDampeningTimer => {
                self.start_dampening_timer(&name);
            }
            WriteCallbackAction::ArmFailureBackoff => {
                self.start_failure_backoff(&name);
            }
        }
        Ok(())
    }

    async fn on_membership_event(&mut self, event: MembershipEvent) -> Result<(), AttrdError> {
        match event {
            MembershipEvent::NameLearned { node, node_id, uuid } => {
                self.writer.register_peer(&node, node_id, uuid);
                self.election.add_voter(&node, node_id);
            }
            MembershipEvent::ProcessMaskChanged { node, attrd_running } => {
                let effects =
                    self.membership.handle_process_mask_changed(&mut self.store, &node, attrd_running);
                self.finish_eviction(effects);
            }
            MembershipEvent::StateChanged { node, member, is_remote } => {
                let is_writer = self.election.election_won();
                let effects = self.membership.handle_state_changed(
                    &mut self.store,
                    &self.replication,
                    &node,
                    member,
                    is_remote,
                    is_writer,
                );
                if let Some(broadcast_msg) = effects.broadcast.clone() {
                    self.send_to(&node, broadcast_msg).await?;
                }
                self.finish_eviction(effects);
            }
        }
        Ok(())
    }

    fn finish_eviction(&mut self, effects: crate::core::membership::MembershipEffects) {
        if let Some(node) = effects.evicted_node {
            self.writer.forget_peer(&node);
            self.election.remove_voter(&node);
        }
    }

    async fn on_client_request(
        &mut self,
        request: ClientRequest,
        reply: oneshot::Sender<ClientReply>,
    ) -> Result<(), AttrdError> {
        let response = self.handle_client_request(request).await?;
        let _ = reply.send(response);
        Ok(())
    }

    async fn handle_client_request(&mut self, request: ClientRequest) -> Result<ClientReply, AttrdError> {
        match request {
            ClientRequest::Update(req) => {
                self.client_update(req).await?;
                Ok(ClientReply::Ack)
            }
            ClientRequest::Query { name, host } => Ok(self.dispatcher.handle_query(&self.store, &name, host.as_deref())),
            ClientRequest::ClearFailure { resource, operation, interval_ms } => {
                let msgs = self.dispatcher.handle_clear_failure(
                    &self.store,
                    resource.as_deref(),
                    operation.as_deref(),
                    interval_ms,
                    self.propagate_clear_failure_to_peers,
                )?;
                for msg in msgs {
                    self.broadcast(msg.clone()).await?;
                    self.apply_local_copy(msg).await?;
                }
                Ok(ClientReply::Ack)
            }
            ClientRequest::Refresh => {
                self.writer.write_all(&mut self.store, &mut self.timers, false, true).await?;
                Ok(ClientReply::Ack)
            }
            ClientRequest::PeerRemove { host, host_id } => {
                let msg = self
                    .dispatcher
                    .handle_peer_remove(host.as_deref(), host_id, |id| self.writer.find_peer_by_id(id))?;
                self.broadcast(msg.clone()).await?;
                if let Message::PeerRemove { node, .. } = msg {
                    self.replication.handle_peer_remove(&mut self.store, &node);
                    self.writer.forget_peer(&node);
                    self.election.remove_voter(&node);
                }
                Ok(ClientReply::Ack)
            }
        }
    }

    async fn client_update(&mut self, req: UpdateRequest) -> Result<(), AttrdError> {
        let msgs = self.dispatcher.handle_update(&self.store, &req)?;
        for msg in msgs {
            self.broadcast(msg.clone()).await?;
            self.apply_local_copy(msg).await?;
        }
        Ok(())
    }

    /// Applies one of our own broadcasts to the local replica too, exactly
    /// as a peer receiving it over the wire would (spec.md §2's data flow:
    /// "client -> H -> C (broadcast) -> all peers' E", which includes the
    /// originator).
    async fn apply_local_copy(&mut self, msg: Message) -> Result<(), AttrdError> {
        let local_node = self.local_node.clone();
        match msg {
            Message::Update(fields) => self.apply_peer_update(UpdateOp::Update, fields, &local_node).await,
            Message::UpdateBoth(fields) => self.apply_peer_update(UpdateOp::UpdateBoth, fields, &local_node).await,
            Message::UpdateDelay(fields) => self.apply_peer_update(UpdateOp::UpdateDelay, fields, &local_node).await,
            Message::PeerRemove { node, .. } => {
                self.replication.handle_peer_remove(&mut self.store, &node);
                Ok(())
            }
            Message::ClearFailure { .. } => Ok(()),
            _ => Ok(()),
        }
    }

    /// Drives the event loop forever. Returns only on an unrecoverable
    /// transport or CDB failure (spec.md §7), at which point `main` logs
    /// the error and exits non-zero for the supervisor to restart.
    pub async fn run(mut self) -> Result<(), AttrdError> {
        self.startup().await?;
        loop {
            tokio::select! {
                biased;

                result = self.shutdown_rx.recv(), if !self.shutting_down => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            self.shutting_down = true;
                            tracing::info!("entering graceful shutdown: non-election traffic will be dropped");
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
                Some(fired) = self.channels.timer_rx.recv() => {
                    self.on_timer_fired(fired).await?;
                }
                Some((tag, result)) = self.channels.cdb_rx.recv() => {
                    self.on_cdb_callback(tag, result).await?;
                }
                Some(event) = self.channels.membership_rx.recv() => {
                    self.on_membership_event(event).await?;
                }
                Some((req, reply)) = self.channels.client_rx.recv() => {
                    self.on_client_request(req, reply).await?;
                }
                inbound = self.transport.recv() => {
                    match inbound {
                        Some((from, envelope)) => self.on_inbound(from, envelope).await?,
                        None => return Err(AttrdError::Transport("transport closed".to_string())),
                    }
                }
            }
        }
    }
}
