//! # Summary
//!
//! This module defines the identifiers that the runtime fabric and the
//! Paxos roles are threaded through: the physical identity of a hosted
//! agent, the virtual aliases an agent uses in its own routing table, the
//! port a message is demultiplexed to within a destination agent, and the
//! `host:port` address of the box (process) an agent runs on.

use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identity of a single hosted agent, across the entire configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysID(pub u16);

/// Alias an agent uses in its own routing table; meaningless outside of
/// the agent that declared it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualID(pub u16);

/// Demultiplexing selector within a destination agent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port(pub u16);

impl Port {
    /// Peer-to-peer replica traffic (P1A/P1B/P2A/P2B/Decision).
    pub const PEER: Port = Port(1);
    /// Client-to-replica request traffic.
    pub const CLIENT: Port = Port(2);
    /// Controller command traffic.
    pub const CONTROL: Port = Port(9);
}

impl fmt::Display for PhysID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VirtualID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PhysID {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(PhysID)
    }
}

impl FromStr for VirtualID {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(VirtualID)
    }
}

impl FromStr for Port {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Port)
    }
}

/// The canonical `host:port` address of a node. Doubles as identity and
/// as a dialable TCP endpoint. Ordered lexicographically on its textual
/// `host:port` form (not numerically on the underlying `SocketAddr`),
/// which the Link Manager's dial rule (`4.2`) relies on to avoid
/// dual-connection races between any two boxes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoxID(SocketAddr);

impl BoxID {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl PartialOrd for BoxID {
    fn partial_cmp(&self, rhs: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(rhs))
    }
}

impl Ord for BoxID {
    fn cmp(&self, rhs: &Self) -> std::cmp::Ordering {
        self.0.to_string().cmp(&rhs.0.to_string())
    }
}

impl fmt::Display for BoxID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BoxID {
    type Err = std::net::AddrParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(BoxID)
    }
}

impl TryFrom<String> for BoxID {
    type Error = std::net::AddrParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BoxID> for String {
    fn from(box_id: BoxID) -> Self {
        box_id.0.to_string()
    }
}

impl From<SocketAddr> for BoxID {
    fn from(addr: SocketAddr) -> Self {
        BoxID(addr)
    }
}
