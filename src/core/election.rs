// src/core/election.rs

//! The election gate seam (component D, spec.md §4.4). The real election
//! library (corosync votequorum or similar) is out of scope (spec.md §1);
//! this module provides the trait the rest of the core drives and one
//! concrete `BullyElection` implementation, grounded on the teacher's
//! Warden failover-voting shape (`core/warden/state.rs`'s `FailoverState`/
//! `votes`/`config_epoch`).

use std::collections::HashMap;
use std::time::Instant;

/// The four operations the writer-or-elect discipline needs from the
/// election library (spec.md §4.4); implementations are free to run an
/// arbitrarily complex protocol behind these calls.
pub trait ElectionGate: Send {
    /// Starts an election unless one is already in progress.
    fn election_start_if_needed(&mut self);
    /// True iff this daemon currently believes itself the writer.
    fn election_won(&self) -> bool;
    /// Records that `node` won the election for `epoch`, updating local
    /// won/lost state accordingly.
    fn declare_winner(&mut self, node: &str, epoch: u64);
    /// Removes a peer from the voter set, e.g. after membership eviction
    /// (spec.md §4.7).
    fn remove_voter(&mut self, peer: &str);
    /// Adds (or updates the id of) a peer in the voter set, e.g. once its
    /// numeric cluster id is learned (spec.md §4.7).
    fn add_voter(&mut self, peer: &str, peer_id: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Voting,
    Won,
    Lost,
}

/// A simple epoch-stamped bully algorithm keyed by lowest node id, sufficient
/// to exercise winner/loser transitions without a real cluster election
/// library. Lower `node_id` always wins among currently known voters.
pub struct BullyElection {
    local_node: String,
    local_id: u64,
    voters: HashMap<String, u64>,
    config_epoch: u64,
    state: ElectionState,
    votes: HashMap<String, Instant>,
}

impl BullyElection {
    pub fn new(local_node: impl Into<String>, local_id: u64) -> Self {
        Self {
            local_node: local_node.into(),
            local_id,
            voters: HashMap::new(),
            config_epoch: 0,
            state: ElectionState::Idle,
            votes: HashMap::new(),
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.config_epoch
    }
}

impl ElectionGate for BullyElection {
    fn election_start_if_needed(&mut self) {
        if self.state == ElectionState::Voting {
            return;
        }
        self.config_epoch += 1;
        self.state = ElectionState::Voting;
        self.votes.insert(self.local_node.clone(), Instant::now());

        let winner_id = self
            .voters
            .values()
            .copied()
            .chain(std::iter::once(self.local_id))
            .min()
            .expect("at least the local id is always present");

        let winner = if winner_id == self.local_id {
            self.local_node.clone()
        } else {
            self.voters
                .iter()
                .find(|(_, &id)| id == winner_id)
                .map(|(name, _)| name.clone())
                .expect("winner_id was drawn from voters or local_id")
        };
        let epoch = self.config_epoch;
        self.declare_winner(&winner, epoch);
    }

    fn election_won(&self) -> bool {
        self.state == ElectionState::Won
    }

    fn declare_winner(&mut self, node: &str, epoch: u64) {
        if epoch < self.config_epoch {
            tracing::debug!(epoch, current = self.config_epoch, "ignoring stale election result");
            return;
        }
        self.config_epoch = epoch;
        self.state = if node == self.local_node {
            ElectionState::Won
        } else {
            ElectionState::Lost
        };
        tracing::info!(node, epoch, won = self.election_won(), "election decided");
    }

    fn remove_voter(&mut self, peer: &str) {
        self.voters.remove(peer);
        self.votes.remove(peer);
    }

    fn add_voter(&mut self, peer: &str, peer_id: u64) {
        self.voters.insert(peer.to_string(), peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_node_id_wins() {
        let mut gate = BullyElection::new("n2", 2);
        gate.add_voter("n1", 1);
        gate.add_voter("n3", 3);
        gate.election_start_if_needed();
        assert!(!gate.election_won());
        assert_eq!(gate.state(), ElectionState::Lost);
    }

    #[test]
    fn sole_member_always_wins() {
        let mut gate = BullyElection::new("n1", 1);
        gate.election_start_if_needed();
        assert!(gate.election_won());
    }

    #[test]
    fn stale_winner_announcement_is_ignored() {
        let mut gate = BullyElection::new("n1", 5);
        gate.add_voter("n2", 1);
        gate.election_start_if_needed();
        assert!(!gate.election_won());
        // A late announcement for an older epoch must not override state.
        gate.declare_winner("n1", 0);
        assert!(!gate.election_won());
    }

    #[test]
    fn removed_voter_no_longer_affects_future_elections() {
        let mut gate = BullyElection::new("n2", 2);
        gate.add_voter("n1", 1);
        gate.remove_voter("n1");
        gate.election_start_if_needed();
        assert!(gate.election_won());
    }
}
