//! # Summary
//!
//! Loads the static node configuration: a mapping from `PhysID` to an
//! agent descriptor (variant tag, box address, attribute map, routing
//! table), stored on disk as JSON. `configs/configParser.go` in the
//! original left this format an unimplemented stub; this is the first
//! concrete schema for it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::identity::{BoxID, PhysID, Port, VirtualID};

/// Agent variant tags recognized by the configuration format. Only
/// `PaxosReplica` is implemented by this crate's Agent Host; the rest are
/// accepted so that configs mixing in externally-supplied agents still
/// validate, but are fatal if one is ever scheduled onto this node's box.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentVariant {
    Chat,
    Dummy,
    KvsReplica,
    KvsClient,
    KvsTty,
    PaxosReplica,
    PaxosClient,
    PaxosController,
}

impl AgentVariant {
    pub fn is_locally_hostable(self) -> bool {
        matches!(self, AgentVariant::PaxosReplica)
    }
}

#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub dest_phys: PhysID,
    pub dest_port: Port,
}

#[derive(Clone, Debug)]
pub struct AgentDescriptor {
    pub variant: AgentVariant,
    pub box_id: BoxID,
    pub attrs: HashMap<String, String>,
    pub routes: HashMap<VirtualID, RouteEntry>,
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub agents: HashMap<PhysID, AgentDescriptor>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("agent id {0:?} is not a valid PhysID")]
    BadAgentId(String),
    #[error("route key {0:?} is not a valid VirtualID")]
    BadRouteId(String),
    #[error("agent {0} has a route to unknown agent {1}")]
    DanglingRoute(PhysID, PhysID),
    #[error("agent {0} has variant {1:?}, which this node cannot host locally")]
    UnhostableVariant(PhysID, AgentVariant),
}

/// On-disk shape: JSON object keys are always strings, so `PhysID` and
/// `VirtualID` keys are parsed out of the map keys after deserialization
/// rather than as part of it.
#[derive(Deserialize)]
struct RawConfig {
    agents: HashMap<String, RawAgent>,
}

#[derive(Deserialize)]
struct RawAgent {
    variant: AgentVariant,
    #[serde(rename = "box")]
    box_id: BoxID,
    #[serde(default)]
    attrs: HashMap<String, String>,
    #[serde(default)]
    routes: HashMap<String, RawRoute>,
}

#[derive(Deserialize)]
struct RawRoute {
    dest_phys: u16,
    dest_port: u16,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;

        let mut agents = HashMap::new();
        for (id, raw_agent) in raw.agents {
            let phys_id = id
                .parse::<u16>()
                .map(PhysID)
                .map_err(|_| ConfigError::BadAgentId(id.clone()))?;

            let mut routes = HashMap::new();
            for (vid, route) in raw_agent.routes {
                let virtual_id = vid
                    .parse::<u16>()
                    .map(VirtualID)
                    .map_err(|_| ConfigError::BadRouteId(vid.clone()))?;
                routes.insert(
                    virtual_id,
                    RouteEntry { dest_phys: PhysID(route.dest_phys), dest_port: Port(route.dest_port) },
                );
            }

            agents.insert(
                phys_id,
                AgentDescriptor {
                    variant: raw_agent.variant,
                    box_id: raw_agent.box_id,
                    attrs: raw_agent.attrs,
                    routes,
                },
            );
        }

        let config = Config { agents };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (&id, descriptor) in &self.agents {
            for route in descriptor.routes.values() {
                if !self.agents.contains_key(&route.dest_phys) {
                    return Err(ConfigError::DanglingRoute(id, route.dest_phys));
                }
            }
        }
        Ok(())
    }

    /// Agents this node must instantiate: those whose configured box
    /// matches `my_box`, sorted by `PhysID`. Fails if any of them names a
    /// variant this binary has no implementation for.
    pub fn local_agents(&self, my_box: &BoxID) -> Result<Vec<(PhysID, &AgentDescriptor)>, ConfigError> {
        let mut local = Vec::new();
        for (&id, descriptor) in &self.agents {
            if &descriptor.box_id == my_box {
                if !descriptor.variant.is_locally_hostable() {
                    return Err(ConfigError::UnhostableVariant(id, descriptor.variant));
                }
                local.push((id, descriptor));
            }
        }
        local.sort_by_key(|(id, _)| *id);
        Ok(local)
    }
}
