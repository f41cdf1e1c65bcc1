//! # Summary
//!
//! This crate implements one hosted node's runtime: the link/link-manager
//! transport fabric, the virtual-routing Router (`NodeContext`), the
//! failure detector, agent configuration loading, and the Agent Host that
//! assembles Acceptor/Leader/Replica sub-roles into a running
//! `paxos-replica` agent. `node` (the `paxos-node` binary) is the thin CLI
//! shell around it.

mod channel;
mod config;
mod failure_detector;
mod host;
mod identity;
mod link;
mod link_manager;
mod message;
mod shared;
mod thread;

pub use crate::channel::{new as channel_pair, Rx, Tx};
pub use crate::config::{Config, ConfigError};
pub use crate::failure_detector::FailureDetector;
pub use crate::host::AgentHost;
pub use crate::identity::{BoxID, PhysID, Port, VirtualID};
pub use crate::link_manager::LinkManager;
pub use crate::message::{ControlCommand, Request};
pub use crate::shared::NodeContext;
