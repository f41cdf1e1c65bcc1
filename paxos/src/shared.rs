//! # Summary
//!
//! `NodeContext` is the per-node hub every local agent and background
//! task shares a handle to: the static configuration, the Link Manager,
//! the Failure Detector, and the Router choke-point agents call to send
//! (`4.3`/`4.4`). Plays the role the teacher's generic `Shared<S>` hub
//! played for its connection-forwarding tables, specialized here to the
//! concrete virtual-routing/`BoxID` model instead of a pluggable
//! `State<S>`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel;
use crate::config::Config;
use crate::failure_detector::FailureDetector;
use crate::identity::{BoxID, PhysID, Port, VirtualID};
use crate::link_manager::LinkManager;

/// An inbound delivery destined for one local agent: `(port, payload)`.
pub type Delivery = (Port, String);

pub struct NodeContext {
    pub my_box: BoxID,
    pub config: Config,
    pub link_manager: Arc<LinkManager>,
    pub failure_detector: Arc<FailureDetector>,
    /// Box-wide "some hosted leader is currently active" flag, shared
    /// with the Link Manager's pinger (`9.2`'s `ping <box> [leader]` tag).
    pub leader_flag: Arc<AtomicBool>,
    loss_rate: RwLock<f64>,
    local_agents: RwLock<std::collections::HashMap<PhysID, channel::Tx<Delivery>>>,
    /// Master control channel's `get`/`broadcast` message log (`6`); kept
    /// separate from the replicated Paxos log, which has its own `dump`.
    chat_log: RwLock<Vec<String>>,
}

impl NodeContext {
    pub fn new(
        my_box: BoxID,
        config: Config,
        link_manager: Arc<LinkManager>,
        failure_detector: Arc<FailureDetector>,
        leader_flag: Arc<AtomicBool>,
        loss_rate: f64,
    ) -> Arc<Self> {
        Arc::new(NodeContext {
            my_box,
            config,
            link_manager,
            failure_detector,
            leader_flag,
            loss_rate: RwLock::new(loss_rate),
            local_agents: RwLock::new(std::collections::HashMap::new()),
            chat_log: RwLock::new(Vec::new()),
        })
    }

    pub fn set_loss_rate(&self, rate: f64) {
        *self.loss_rate.write() = rate;
    }

    /// Appends an inbound `chatroom` frame's text to the master control
    /// channel's message log (`6`).
    pub fn record_chat(&self, text: String) {
        self.chat_log.write().push(text);
    }

    /// Snapshot of the master control channel's message log, in arrival
    /// order, for a `get` reply.
    pub fn chat_messages(&self) -> Vec<String> {
        self.chat_log.read().clone()
    }

    /// Runs the Link Manager's inbound-chat pump until the channel
    /// closes. Spawned once by the node's main loop alongside
    /// `pump_transport`.
    pub async fn pump_chat(self: Arc<Self>, mut inbound: channel::Rx<(BoxID, String)>) {
        while let Some((_peer, text)) = inbound.recv().await {
            self.record_chat(text);
        }
    }

    /// Registers the inbound queue for a locally-hosted agent. Called once
    /// by the Agent Host per agent it instantiates.
    pub fn register_local_agent(&self, phys_id: PhysID, inbound: channel::Tx<Delivery>) {
        self.local_agents.write().insert(phys_id, inbound);
    }

    pub fn deregister_local_agent(&self, phys_id: PhysID) {
        self.local_agents.write().remove(&phys_id);
    }

    /// Router `send`: resolves `sender`'s routing entry for `vdest`,
    /// applies the configured loss probability, then either delivers
    /// locally or hands a `msg` line to the Link Manager (`4.3`).
    pub fn send(&self, sender: PhysID, vdest: VirtualID, payload: &str) {
        let route = match self.config.agents.get(&sender).and_then(|descriptor| descriptor.routes.get(&vdest)) {
            Some(route) => route,
            None => {
                panic!(
                    "[INTERNAL ERROR]: agent {} has no route for virtual destination {}",
                    sender, vdest
                );
            }
        };
        let (dest_phys, dest_port) = (route.dest_phys, route.dest_port);

        if rand::random::<f64>() < *self.loss_rate.read() {
            return;
        }

        let dest_box = match self.config.agents.get(&dest_phys) {
            Some(descriptor) => descriptor.box_id.clone(),
            None => panic!("[INTERNAL ERROR]: route targets unknown agent {}", dest_phys),
        };

        if dest_box == self.my_box {
            self.deliver_local(dest_phys, dest_port, payload.to_string());
        } else {
            let line = format!("{} {} {} {}", sender, dest_phys, dest_port, payload);
            self.link_manager.send(&dest_box, &line);
        }
    }

    fn deliver_local(&self, dest_phys: PhysID, dest_port: Port, payload: String) {
        if let Some(inbound) = self.local_agents.read().get(&dest_phys) {
            inbound.try_send((dest_port, payload));
        }
    }

    /// Inbound demultiplex (`4.8`): given a transport line's payload
    /// (the part after the `msg ` tag), parse `<sender> <dest_phys>
    /// <dest_port> <payload>` and deliver locally. Drops malformed
    /// frames with a diagnostic per the wire-parse-error policy (`7`).
    pub fn handle_transport_line(&self, line: &str) {
        let mut fields = line.splitn(4, ' ');
        let (sender, dest_phys, dest_port, payload) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(sender), Some(dest_phys), Some(dest_port), Some(payload)) => {
                    (sender, dest_phys, dest_port, payload)
                }
                _ => {
                    log::debug!("dropping malformed transport line: {:?}", line);
                    return;
                }
            };

        let (dest_phys, dest_port) = match (dest_phys.parse::<PhysID>(), dest_port.parse::<Port>()) {
            (Ok(dest_phys), Ok(dest_port)) => (dest_phys, dest_port),
            _ => {
                log::debug!("dropping transport line with unparsable header: {:?}", line);
                return;
            }
        };
        let _ = sender;

        self.deliver_local(dest_phys, dest_port, payload.to_string());
    }

    /// Runs the Link Manager's inbound-transport pump until the channel
    /// closes. Spawned once by the node's main loop.
    pub async fn pump_transport(self: Arc<Self>, mut inbound: channel::Rx<(BoxID, String)>) {
        while let Some((_peer, line)) = inbound.recv().await {
            self.handle_transport_line(&line);
        }
    }
}
