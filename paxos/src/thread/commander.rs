//! # Summary
//!
//! Phase 2 of Multi-Paxos for one slot. A commander is spawned by the
//! leader for one `PValue`; it narrowcasts `p2a` to every acceptor and
//! collects `p2b` replies until a majority accept at its ballot (in
//! which case it broadcasts the decision to every replica, itself
//! included) or a reply reveals a higher ballot (preemption). Expressed
//! as an `async fn` the way `scout.rs` is.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::channel;
use crate::identity::{PhysID, VirtualID};
use crate::message::{P2b, PValue, PeerMessage, Proposal};
use crate::shared::NodeContext;
use crate::thread::leader::LeaderEvent;

pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Runs Phase 2 for `pvalue` to completion, reporting preemption back to
/// the leader's main channel. Decision broadcast on success happens as
/// a direct side effect (every replica, including this one, receives
/// `decision` on the peer port); the leader does not need to be told of
/// success, since the commander's own exit is the signal (see `9`'s note
/// on per-slot commander channel reclamation).
pub async fn run(
    pvalue: PValue,
    my_id: PhysID,
    peers: Arc<Vec<PhysID>>,
    ctx: Arc<NodeContext>,
    mut inbox: channel::Rx<P2b>,
    leader_events: channel::Tx<LeaderEvent>,
) {
    let majority = peers.len() / 2 + 1;
    let mut accepted: HashSet<PhysID> = HashSet::new();

    let send_p2a = || {
        let line = PeerMessage::P2a(pvalue.clone()).to_line();
        for peer in peers.iter() {
            ctx.send(my_id, VirtualID(peer.0), &line);
        }
    };

    send_p2a();
    let mut ticker = tokio::time::interval(RETRANSMIT_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => send_p2a(),
            received = inbox.recv() => {
                let p2b = match received {
                    Some(p2b) => p2b,
                    None => return,
                };

                if p2b.ballot == pvalue.ballot {
                    accepted.insert(p2b.acceptor_id);
                    if accepted.len() >= majority {
                        log::debug!("commander for slot {} decided at {:?}", pvalue.slot, pvalue.ballot);
                        let decision = PeerMessage::Decision(Proposal { slot: pvalue.slot, request: pvalue.request.clone() });
                        let line = decision.to_line();
                        for peer in peers.iter() {
                            ctx.send(my_id, VirtualID(peer.0), &line);
                        }
                        return;
                    }
                } else if p2b.ballot > pvalue.ballot {
                    log::debug!("commander for slot {} preempted by {:?}", pvalue.slot, p2b.ballot);
                    leader_events.try_send(LeaderEvent::Preempted(p2b.ballot));
                    return;
                }
            }
        }
    }
}
