//! # Summary
//!
//! The `Leader` role: ballot election and per-slot proposal driving.
//! Owns the current ballot, whether it is currently active (a scout has
//! been adopted since the last preemption), and the table of proposals
//! it is responsible for pushing to acceptors. Spawns one scout at a
//! time for Phase 1 and one commander per in-flight slot for Phase 2.
//! Grounded in the teacher's `thread/leader.rs` state machine
//! (`respond_propose`/`respond_preempt`/`respond_adopt`), re-expressed
//! as a single `async fn` task reading from its own event channel
//! instead of polling a `Future`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::channel;
use crate::identity::PhysID;
use crate::message::{Ballot, P1b, P2b, PValue, Proposal, Request};
use crate::shared::NodeContext;
use crate::thread::{commander, scout};

/// Base unit for Phase 1/Phase 2 retransmission and for the
/// post-preemption damping backoff (`5`: "retransmit > link-death gives
/// acceptors a chance to recover").
pub const TIMEOUT_DURATION: Duration = Duration::from_secs(1);

/// The leader's post-preemption backoff is a multiple of
/// `TIMEOUT_DURATION`, not incidental (`9`): too short and dueling
/// leaders livelock forever re-preempting each other's scouts.
const PREEMPT_BACKOFF_FACTOR: f64 = 4.0;

/// What the leader's main task reacts to: a new client proposal handed
/// down from the replica, a scout's successful adoption, or a
/// preemption observed by either a scout or a commander.
#[derive(Debug)]
pub enum LeaderEvent {
    Proposal(Proposal),
    Adopted(HashMap<u64, PValue>),
    Preempted(Ballot),
}

/// Handle held by the replica (to hand off proposals) and by the
/// agent's inbound demultiplexer (to route `p1b`/`p2b` replies to
/// whichever scout or commander currently owns them).
#[derive(Clone)]
pub struct LeaderHandle {
    events: channel::Tx<LeaderEvent>,
    scout_inbox: Arc<RwLock<Option<channel::Tx<P1b>>>>,
    commander_inboxes: Arc<RwLock<HashMap<u64, channel::Tx<P2b>>>>,
}

impl LeaderHandle {
    pub fn propose(&self, proposal: Proposal) {
        self.events.try_send(LeaderEvent::Proposal(proposal));
    }

    /// Routes an inbound `p1b` to the currently running scout, if any.
    /// A `p1b` that arrives after the scout it was addressed to has
    /// already exited (adopted or preempted) is silently dropped.
    pub fn route_p1b(&self, p1b: P1b) {
        if let Some(tx) = self.scout_inbox.read().as_ref() {
            tx.try_send(p1b);
        }
    }

    /// Routes an inbound `p2b` to the commander owning its slot, if
    /// still live.
    pub fn route_p2b(&self, p2b: P2b) {
        if let Some(tx) = self.commander_inboxes.read().get(&p2b.slot) {
            tx.try_send(p2b);
        }
    }
}

/// Spawns the leader's main task and an initial scout for ballot
/// `(my_id, 0)`. `peers` is the full acceptor/replica set (this node
/// included), used both for Phase 1/2 narrowcast and decision broadcast.
/// `leader_flag` is the box-wide flag the Link Manager's pinger tags
/// outbound pings with (`9.2`); set while this leader is active (adopted
/// and not yet preempted) and cleared otherwise.
pub fn spawn(my_id: PhysID, peers: Vec<PhysID>, ctx: Arc<NodeContext>, leader_flag: Arc<AtomicBool>) -> LeaderHandle {
    let peers = Arc::new(peers);
    let (events_tx, events_rx) = channel::new();
    let scout_inbox = Arc::new(RwLock::new(None));
    let commander_inboxes = Arc::new(RwLock::new(HashMap::new()));

    let handle =
        LeaderHandle { events: events_tx.clone(), scout_inbox: scout_inbox.clone(), commander_inboxes: commander_inboxes.clone() };

    tokio::spawn(run(my_id, peers, ctx, events_tx, events_rx, scout_inbox, commander_inboxes, leader_flag));

    handle
}

struct State {
    ballot: Ballot,
    active: bool,
    proposals: HashMap<u64, Proposal>,
}

async fn run(
    my_id: PhysID,
    peers: Arc<Vec<PhysID>>,
    ctx: Arc<NodeContext>,
    events_tx: channel::Tx<LeaderEvent>,
    mut events_rx: channel::Rx<LeaderEvent>,
    scout_inbox: Arc<RwLock<Option<channel::Tx<P1b>>>>,
    commander_inboxes: Arc<RwLock<HashMap<u64, channel::Tx<P2b>>>>,
    leader_flag: Arc<AtomicBool>,
) {
    let mut state = State { ballot: Ballot::new(0, my_id), active: false, proposals: HashMap::new() };

    spawn_scout(my_id, &peers, &ctx, state.ballot, &scout_inbox, &events_tx);

    while let Some(event) = events_rx.recv().await {
        match event {
            LeaderEvent::Proposal(proposal) => {
                if state.proposals.contains_key(&proposal.slot) {
                    continue;
                }
                log::debug!("leader {} recorded proposal for slot {}", my_id, proposal.slot);
                let active = state.active;
                let ballot = state.ballot;
                state.proposals.insert(proposal.slot, proposal.clone());
                if active {
                    spawn_commander(my_id, &peers, &ctx, ballot, proposal.slot, proposal.request, &commander_inboxes, &events_tx);
                }
            }

            LeaderEvent::Adopted(best_per_slot) => {
                for (slot, pvalue) in best_per_slot {
                    state
                        .proposals
                        .entry(slot)
                        .and_modify(|existing| existing.request = pvalue.request.clone())
                        .or_insert(Proposal { slot, request: pvalue.request });
                }

                state.active = true;
                leader_flag.store(true, Ordering::Relaxed);
                ctx.failure_detector.note_alive(ctx.my_box.clone(), true);
                log::info!("leader {} adopted with ballot {:?}", my_id, state.ballot);

                let ballot = state.ballot;
                let proposals: Vec<Proposal> = state.proposals.values().cloned().collect();
                for proposal in proposals {
                    spawn_commander(my_id, &peers, &ctx, ballot, proposal.slot, proposal.request, &commander_inboxes, &events_tx);
                }
            }

            LeaderEvent::Preempted(preemptor) => {
                if preemptor <= state.ballot {
                    continue;
                }
                log::debug!("leader {} preempted by {:?}", my_id, preemptor);
                state.active = false;
                leader_flag.store(false, Ordering::Relaxed);
                ctx.failure_detector.note_alive(ctx.my_box.clone(), false);
                state.ballot = Ballot::new(preemptor.n + 1, my_id);

                let factor = PREEMPT_BACKOFF_FACTOR + rand::random::<f64>() * 2.0;
                tokio::time::sleep(TIMEOUT_DURATION.mul_f64(factor)).await;

                spawn_scout(my_id, &peers, &ctx, state.ballot, &scout_inbox, &events_tx);
            }
        }
    }
}

fn spawn_scout(
    my_id: PhysID,
    peers: &Arc<Vec<PhysID>>,
    ctx: &Arc<NodeContext>,
    ballot: Ballot,
    scout_inbox: &Arc<RwLock<Option<channel::Tx<P1b>>>>,
    events_tx: &channel::Tx<LeaderEvent>,
) {
    let (tx, rx) = channel::new();
    *scout_inbox.write() = Some(tx);
    tokio::spawn(scout::run(ballot, my_id, peers.clone(), ctx.clone(), rx, events_tx.clone()));
}

#[cfg(test)]
impl LeaderHandle {
    /// Builds a handle with no backing task, for replica unit tests that
    /// only need to observe what gets proposed.
    pub fn for_test() -> (Self, channel::Rx<LeaderEvent>) {
        let (tx, rx) = channel::new();
        let handle = LeaderHandle {
            events: tx,
            scout_inbox: Arc::new(RwLock::new(None)),
            commander_inboxes: Arc::new(RwLock::new(HashMap::new())),
        };
        (handle, rx)
    }
}

fn spawn_commander(
    my_id: PhysID,
    peers: &Arc<Vec<PhysID>>,
    ctx: &Arc<NodeContext>,
    ballot: Ballot,
    slot: u64,
    request: Request,
    commander_inboxes: &Arc<RwLock<HashMap<u64, channel::Tx<P2b>>>>,
    events_tx: &channel::Tx<LeaderEvent>,
) {
    let pvalue = PValue { ballot, slot, request };
    let (tx, rx) = channel::new();
    commander_inboxes.write().insert(slot, tx);

    let peers = peers.clone();
    let ctx = ctx.clone();
    let events_tx = events_tx.clone();
    let commander_inboxes = commander_inboxes.clone();
    tokio::spawn(async move {
        commander::run(pvalue, my_id, peers, ctx, rx, events_tx).await;
        commander_inboxes.write().remove(&slot);
    });
}
