//! # Summary
//!
//! The Acceptor role: Paxos's distributed memory. Keeps the highest
//! ballot it has promised and the most recently accepted `PValue` per
//! slot (`4.5`). Guarded by a single `RwLock` rather than owning a
//! private task+channel the way the teacher's `Acceptor` did — `on_p1a`/
//! `on_p2a` are cheap, so they run synchronously on the inbound
//! demultiplex path, per `5`'s "guarded shared map" discipline.

use std::cmp;
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::identity::PhysID;
use crate::message::{Ballot, P1b, P2b, PValue, PeerMessage};

#[derive(Default)]
struct State {
    ballot: Option<Ballot>,
    accepted: HashMap<u64, PValue>,
}

pub struct Acceptor {
    id: PhysID,
    state: RwLock<State>,
}

impl Acceptor {
    pub fn new(id: PhysID) -> Self {
        Acceptor { id, state: RwLock::new(State::default()) }
    }

    /// `on_p1a`: adopts `bal` if it's new or higher, then always replies
    /// with the acceptor's *current* ballot (which may exceed `bal`,
    /// letting the scout detect preemption) and every accepted pvalue.
    pub fn on_p1a(&self, bal: Ballot) -> PeerMessage {
        let mut state = self.state.write();
        state.ballot = Some(state.ballot.map_or(bal, |current| cmp::max(current, bal)));
        let accepted = state.accepted.values().cloned().collect();
        PeerMessage::P1b(P1b { acceptor_id: self.id, ballot: state.ballot.unwrap(), accepted })
    }

    /// `on_p2a`: accepts `pvalue` if its ballot is at least the acceptor's
    /// current one (component-wise `(n, leader_id)`), updating both the
    /// ballot and the per-slot accepted map. Always replies with the
    /// acceptor's current ballot.
    pub fn on_p2a(&self, pvalue: PValue) -> PeerMessage {
        let mut state = self.state.write();
        if state.ballot.is_none() || pvalue.ballot >= state.ballot.unwrap() {
            state.ballot = Some(pvalue.ballot);
            state.accepted.insert(pvalue.slot, pvalue.clone());
        }
        PeerMessage::P2b(P2b { acceptor_id: self.id, slot: pvalue.slot, ballot: state.ballot.unwrap() })
    }
}
