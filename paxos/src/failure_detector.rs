//! # Summary
//!
//! Tracks which peer boxes are currently believed alive, and which of
//! them are currently claiming leader candidacy, purely from the ping
//! stream links already produce. Grounded in
//! `agents/paxos_chatroom/unreliableFailureDetector.go`'s `runPinger`/
//! `receivePing`, which tags pings with an optional `leader` suffix; that
//! tag is carried by this crate's `link::LinkEvent::Alive` and recorded
//! here rather than re-derived from a second ping loop.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::identity::BoxID;

#[derive(Default)]
pub struct FailureDetector {
    alive: RwLock<HashSet<BoxID>>,
    leader_claims: RwLock<HashSet<BoxID>>,
}

impl FailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_alive(&self, peer: BoxID, leader: bool) {
        self.alive.write().insert(peer.clone());
        if leader {
            self.leader_claims.write().insert(peer);
        } else {
            self.leader_claims.write().remove(&peer);
        }
    }

    pub fn note_down(&self, peer: &BoxID) {
        self.alive.write().remove(peer);
        self.leader_claims.write().remove(peer);
    }

    pub fn alive_set(&self) -> Vec<BoxID> {
        let mut alive: Vec<BoxID> = self.alive.read().iter().cloned().collect();
        alive.sort();
        alive
    }

    pub fn leader_claims(&self) -> Vec<BoxID> {
        let mut claims: Vec<BoxID> = self.leader_claims.read().iter().cloned().collect();
        claims.sort();
        claims
    }

    /// Whether `peer` should currently be treated as a leader candidate
    /// for the purpose of admitting new client requests (`4.7`).
    ///
    /// Before any ping carrying the `leader` tag has been observed, every
    /// peer is a candidate (nothing has claimed leadership yet, and the
    /// reference deployment's "every replica is a leader candidate"
    /// config must still be able to admit its first request). Once at
    /// least one box has been observed claiming leadership, only boxes
    /// in `leader_claims` are candidates.
    pub fn is_leader_candidate(&self, peer: &BoxID) -> bool {
        let claims = self.leader_claims.read();
        claims.is_empty() || claims.contains(peer)
    }
}
