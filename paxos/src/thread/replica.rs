//! # Summary
//!
//! The `Replica` role: client-request intake, proposal dispatch,
//! decision learning, and in-order application to the replicated log
//! (`4.7`). Grounded in the teacher's `thread/replica.rs`
//! (`respond_request`/`respond_decision`/`propose`/`perform`), stripped
//! of the user-pluggable state machine (`S: state::State`) since this
//! crate's state machine is fixed: an ordered log of applied requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::channel;
use crate::identity::{PhysID, VirtualID};
use crate::message::{format_committed, ControlCommand, Proposal, Request};
use crate::shared::NodeContext;
use crate::thread::leader::LeaderHandle;

/// What the replica's main task reacts to.
pub enum ReplicaEvent {
    ClientRequest(Request),
    Decision(Proposal),
    Control(ControlCommand),
}

/// Handle held by the agent's inbound demultiplexer.
#[derive(Clone)]
pub struct ReplicaHandle {
    inbox: channel::Tx<ReplicaEvent>,
}

impl ReplicaHandle {
    pub fn client_request(&self, request: Request) {
        self.inbox.try_send(ReplicaEvent::ClientRequest(request));
    }

    pub fn decision(&self, decision: Proposal) {
        self.inbox.try_send(ReplicaEvent::Decision(decision));
    }

    pub fn control(&self, command: ControlCommand) {
        self.inbox.try_send(ReplicaEvent::Control(command));
    }
}

pub fn spawn(my_id: PhysID, ctx: Arc<NodeContext>, leader: LeaderHandle, output_path: Option<String>) -> ReplicaHandle {
    let (tx, rx) = channel::new();
    let replica = Replica::new(my_id, ctx, leader, output_path);
    tokio::spawn(run(replica, rx));
    ReplicaHandle { inbox: tx }
}

async fn run(mut replica: Replica, mut inbox: channel::Rx<ReplicaEvent>) {
    while let Some(event) = inbox.recv().await {
        match event {
            ReplicaEvent::ClientRequest(request) => replica.on_client_request(request),
            ReplicaEvent::Decision(decision) => replica.on_decision(decision.slot, decision.request),
            ReplicaEvent::Control(ControlCommand::Kill) => break,
            ReplicaEvent::Control(command) => replica.on_controller(command),
        }
    }
}

struct Replica {
    my_id: PhysID,
    ctx: Arc<NodeContext>,
    leader: LeaderHandle,
    output_path: Option<String>,

    slot_in: u64,
    slot_out: u64,
    requests: HashSet<Request>,
    proposals: HashMap<u64, Request>,
    decisions: HashMap<u64, Request>,
    app_log: Vec<Request>,
    skip_slots: HashSet<u64>,
}

impl Replica {
    fn new(my_id: PhysID, ctx: Arc<NodeContext>, leader: LeaderHandle, output_path: Option<String>) -> Self {
        Replica {
            my_id,
            ctx,
            leader,
            output_path,
            slot_in: 0,
            slot_out: 0,
            requests: HashSet::new(),
            proposals: HashMap::new(),
            decisions: HashMap::new(),
            app_log: Vec::new(),
            skip_slots: HashSet::new(),
        }
    }

    /// `4.7` `on_client_request` (port 2). Only current leader candidates
    /// admit new requests; everyone else drops them, relying on client
    /// retransmission (`9`'s open question).
    fn on_client_request(&mut self, request: Request) {
        if !self.ctx.failure_detector.is_leader_candidate(&self.ctx.my_box) {
            return;
        }

        if self.decisions.values().any(|decided| *decided == request) {
            self.ack_committed(&request);
            return;
        }

        let already_tracked = self.requests.contains(&request) || self.proposals.values().any(|proposed| *proposed == request);
        if !already_tracked {
            self.requests.insert(request);
        }

        self.propose();
    }

    /// `4.7` `propose`: claim the next free slot (skipping decided and
    /// explicitly-skipped slots) for every still-pending request and
    /// hand it to the local leader.
    fn propose(&mut self) {
        let pending: Vec<Request> = self.requests.drain().collect();
        for request in pending {
            while self.decisions.contains_key(&self.slot_in) || self.skip_slots.contains(&self.slot_in) {
                self.slot_in += 1;
            }
            let slot = self.slot_in;
            self.proposals.insert(slot, request.clone());
            self.leader.propose(Proposal { slot, request });
            self.slot_in += 1;
        }
    }

    /// `4.7` `on_decision` (port 1, `decision` frames). Idempotent per
    /// slot; drains every contiguous decided (or skipped) slot starting
    /// at `slot_out` through `perform`.
    fn on_decision(&mut self, slot: u64, request: Request) {
        if self.decisions.contains_key(&slot) {
            return;
        }
        self.decisions.insert(slot, request);
        self.drain();
        self.propose();
    }

    fn drain(&mut self) {
        loop {
            if !self.decisions.contains_key(&self.slot_out) && self.skip_slots.contains(&self.slot_out) {
                self.slot_out += 1;
                continue;
            }

            let decided = match self.decisions.get(&self.slot_out).cloned() {
                Some(decided) => decided,
                None => break,
            };

            if let Some(proposed) = self.proposals.remove(&self.slot_out) {
                if proposed != decided {
                    self.requests.insert(proposed);
                }
            }

            self.perform(decided);
        }
    }

    /// `4.7` `perform`: skip-duplicate application, advancing `slot_out`
    /// unconditionally.
    fn perform(&mut self, request: Request) {
        let already_applied = self.app_log.iter().any(|applied| *applied == request);
        if !already_applied {
            log::info!("replica {} applying {:?} at slot {}", self.my_id, request, self.slot_out);
            self.app_log.push(request.clone());
            self.ack_committed(&request);
        }
        self.slot_out += 1;
    }

    fn ack_committed(&self, request: &Request) {
        let line = format_committed(request.client_id, request.req_num);
        self.ctx.send(self.my_id, VirtualID(request.client_id.0), &line);
    }

    /// `4.7` `on_controller` (port 9). `Issue` is meaningful only to a
    /// `paxos-client` agent (out of scope here) and is ignored.
    fn on_controller(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Dump => self.dump(),
            ControlCommand::Skip(slot) => {
                self.skip_slots.insert(slot);
                self.drain();
                self.propose();
            }
            ControlCommand::Kill => {}
            ControlCommand::Issue(_) => {}
        }
    }

    /// Writes the applied/decided log to `output_path`, one line per
    /// slot from `0` to `slot_out`, holes rendered as the literal token
    /// `hole` (`8` scenario 6).
    fn dump(&self) {
        let path = match &self.output_path {
            Some(path) => path,
            None => {
                log::warn!("replica {} received dump with no output path configured", self.my_id);
                return;
            }
        };

        let mut lines = Vec::with_capacity(self.slot_out as usize);
        for slot in 0..self.slot_out {
            match self.decisions.get(&slot) {
                Some(request) => lines.push(format!("{}: {}", request.client_id, request.payload)),
                None => lines.push("hole".to_string()),
            }
        }

        let mut text = lines.join("\n");
        if !lines.is_empty() {
            text.push('\n');
        }
        if let Err(err) = std::fs::write(path, text) {
            log::error!("replica {} failed to write dump to {}: {}", self.my_id, path, err);
        }
    }
}
