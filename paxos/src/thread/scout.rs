//! # Summary
//!
//! Phase 1 of Multi-Paxos. A scout is spawned by the leader for one
//! ballot; it narrowcasts `p1a` to every acceptor in the cluster (the
//! full peer set, including this node) and collects `p1b` replies until
//! either a majority agree at its ballot (adoption) or any reply reveals
//! a higher ballot (preemption). Expressed as a plain `async fn` driven
//! by `tokio::select!`, the same idiom this crate's `link.rs`
//! reader/pinger tasks already use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::channel;
use crate::identity::{PhysID, VirtualID};
use crate::message::{Ballot, P1b, PValue, PeerMessage};
use crate::shared::NodeContext;
use crate::thread::leader::LeaderEvent;

/// Interval at which an un-acknowledged `p1a` is resent to the acceptors
/// that haven't yet replied at this ballot.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Runs Phase 1 for `ballot` to completion (adoption or preemption),
/// reporting the outcome back to the leader's main channel. `peers` is
/// the full acceptor set (this node included).
pub async fn run(
    ballot: Ballot,
    my_id: PhysID,
    peers: Arc<Vec<PhysID>>,
    ctx: Arc<NodeContext>,
    mut inbox: channel::Rx<P1b>,
    leader_events: channel::Tx<LeaderEvent>,
) {
    let majority = peers.len() / 2 + 1;
    let mut responded: HashSet<PhysID> = HashSet::new();
    let mut best_per_slot: HashMap<u64, PValue> = HashMap::new();

    let send_p1a = || {
        let line = PeerMessage::P1a(ballot).to_line();
        for peer in peers.iter() {
            ctx.send(my_id, VirtualID(peer.0), &line);
        }
    };

    send_p1a();
    let mut ticker = tokio::time::interval(RETRANSMIT_INTERVAL);
    ticker.tick().await; // first tick fires immediately; the send above already covers it.

    loop {
        tokio::select! {
            _ = ticker.tick() => send_p1a(),
            received = inbox.recv() => {
                let p1b = match received {
                    Some(p1b) => p1b,
                    None => return,
                };

                if p1b.ballot == ballot {
                    if responded.insert(p1b.acceptor_id) {
                        for pvalue in p1b.accepted {
                            best_per_slot
                                .entry(pvalue.slot)
                                .and_modify(|current| if pvalue.ballot > current.ballot { *current = pvalue.clone(); })
                                .or_insert(pvalue);
                        }
                    }
                    if responded.len() >= majority {
                        log::debug!("scout for {:?} adopted with {} acceptors", ballot, responded.len());
                        leader_events.try_send(LeaderEvent::Adopted(best_per_slot));
                        return;
                    }
                } else if p1b.ballot > ballot {
                    log::debug!("scout for {:?} preempted by {:?}", ballot, p1b.ballot);
                    leader_events.try_send(LeaderEvent::Preempted(p1b.ballot));
                    return;
                }
            }
        }
    }
}
