//! # Summary
//!
//! The Agent Host: builds one composite `paxos-replica` agent per
//! locally-hosted `PhysID` out of an `Acceptor`, a `Leader`, and a
//! `Replica`, registers its inbound queue with the `NodeContext` Router,
//! and demultiplexes deliveries by `Port` (`4.6`). Grounded in the
//! teacher's `server/server.rs`, which performed the analogous wiring
//! for its single chatroom agent per process; here the wiring runs once
//! per agent named in the configuration instead of once per process.

use std::collections::HashSet;
use std::sync::Arc;

use crate::channel;
use crate::config::AgentDescriptor;
use crate::identity::{PhysID, Port, VirtualID};
use crate::message::{ControlCommand, PeerMessage, Request};
use crate::shared::{Delivery, NodeContext};
use crate::thread::acceptor::Acceptor;
use crate::thread::leader;
use crate::thread::replica;

/// Handle to one hosted `paxos-replica` agent, kept by the node's main
/// loop so it can be torn down on `kill`.
pub struct AgentHost {
    my_id: PhysID,
    ctx: Arc<NodeContext>,
    replica: replica::ReplicaHandle,
}

impl AgentHost {
    /// Spawns every task that makes up one `paxos-replica` agent and
    /// registers it with the Router. `descriptor`'s routing table is
    /// read once here to derive the acceptor/replica peer set: every
    /// distinct `dest_phys` reachable through a `Port::PEER` route, plus
    /// `my_id` itself, since every replica in this architecture is also
    /// a member of its own acceptor/replica set.
    pub fn spawn(my_id: PhysID, descriptor: &AgentDescriptor, ctx: Arc<NodeContext>, output_path: Option<String>) -> Self {
        let mut peers: HashSet<PhysID> = descriptor
            .routes
            .values()
            .filter(|route| route.dest_port == Port::PEER)
            .map(|route| route.dest_phys)
            .collect();
        peers.insert(my_id);
        let mut peers: Vec<PhysID> = peers.into_iter().collect();
        peers.sort();

        let acceptor = Arc::new(Acceptor::new(my_id));
        let leader = leader::spawn(my_id, peers, ctx.clone(), ctx.leader_flag.clone());
        let replica = replica::spawn(my_id, ctx.clone(), leader.clone(), output_path);

        let (inbound_tx, inbound_rx) = channel::new::<Delivery>();
        ctx.register_local_agent(my_id, inbound_tx);

        tokio::spawn(demux(my_id, ctx.clone(), acceptor, leader, replica.clone(), inbound_rx));

        AgentHost { my_id, ctx, replica }
    }

    /// Deregisters the agent from the Router and tells its replica task
    /// to exit. The leader's scout/commander tasks are left to notice
    /// their channels have gone away on their own next send attempt,
    /// matching `4.6`'s "a killed agent stops answering, it does not
    /// actively tear down in-flight sub-protocols".
    pub fn halt(&self) {
        self.ctx.deregister_local_agent(self.my_id);
        self.replica.control(ControlCommand::Kill);
    }
}

async fn demux(
    my_id: PhysID,
    ctx: Arc<NodeContext>,
    acceptor: Arc<Acceptor>,
    leader: leader::LeaderHandle,
    replica: replica::ReplicaHandle,
    mut inbound: channel::Rx<Delivery>,
) {
    while let Some((port, payload)) = inbound.recv().await {
        match port {
            Port::PEER => on_peer_line(my_id, &ctx, &acceptor, &leader, &replica, &payload),
            Port::CLIENT => on_client_line(&replica, &payload),
            Port::CONTROL => on_control_line(&replica, &payload),
            other => log::debug!("agent {} dropping delivery on unknown port {}", my_id, other),
        }
    }
}

fn on_peer_line(
    my_id: PhysID,
    ctx: &Arc<NodeContext>,
    acceptor: &Arc<Acceptor>,
    leader: &leader::LeaderHandle,
    replica: &replica::ReplicaHandle,
    line: &str,
) {
    let message = match PeerMessage::parse_line(line) {
        Ok(message) => message,
        Err(err) => {
            log::debug!("agent {} dropping unparsable peer line: {}", my_id, err);
            return;
        }
    };

    match message {
        PeerMessage::P1a(ballot) => {
            let reply = acceptor.on_p1a(ballot);
            ctx.send(my_id, VirtualID(ballot.leader_id.0), &reply.to_line());
        }
        PeerMessage::P2a(pvalue) => {
            let leader_id = pvalue.ballot.leader_id;
            let reply = acceptor.on_p2a(pvalue);
            ctx.send(my_id, VirtualID(leader_id.0), &reply.to_line());
        }
        PeerMessage::P1b(p1b) => leader.route_p1b(p1b),
        PeerMessage::P2b(p2b) => leader.route_p2b(p2b),
        PeerMessage::Decision(decision) => replica.decision(decision),
    }
}

fn on_client_line(replica: &replica::ReplicaHandle, line: &str) {
    match Request::parse_line(line) {
        Ok(request) => replica.client_request(request),
        Err(err) => log::debug!("dropping unparsable client request: {}", err),
    }
}

fn on_control_line(replica: &replica::ReplicaHandle, line: &str) {
    match ControlCommand::parse_line(line) {
        Ok(command) => replica.control(command),
        Err(err) => log::debug!("dropping unparsable control command: {}", err),
    }
}
