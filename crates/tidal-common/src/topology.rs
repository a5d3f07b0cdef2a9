//! Spine-leaf fabric topology.
//!
//! Loaded from configuration by both the central controller (which
//! polls port counters per uplink/downlink) and the SDN-side selector
//! (which installs flow rules against concrete ports). Every leaf
//! connects to every spine; inter-leaf traffic crosses exactly one
//! spine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::PathKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpineDef {
    pub name: String,
    /// OpenFlow datapath id of the spine switch.
    pub dpid: u64,
    /// Downlink port towards each leaf, keyed by leaf name.
    pub downlinks: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafDef {
    pub name: String,
    /// OpenFlow datapath id of the leaf switch.
    pub dpid: u64,
    /// Uplink port towards each spine, keyed by spine name.
    pub uplinks: BTreeMap<String, u32>,
    /// Access port of each attached host, keyed by IPv4 address.
    pub hosts: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub spines: Vec<SpineDef>,
    pub leaves: Vec<LeafDef>,
}

impl Topology {
    pub fn leaf(&self, name: &str) -> Option<&LeafDef> {
        self.leaves.iter().find(|l| l.name == name)
    }

    pub fn spine(&self, name: &str) -> Option<&SpineDef> {
        self.spines.iter().find(|s| s.name == name)
    }

    /// Locate a host by IPv4 address: the leaf it hangs off and its
    /// access port.
    pub fn host_location(&self, ip: &str) -> Option<(&LeafDef, u32)> {
        self.leaves
            .iter()
            .find_map(|leaf| leaf.hosts.get(ip).map(|&port| (leaf, port)))
    }

    /// All ordered leaf pairs `(src, dst)` with `src != dst`.
    pub fn ordered_leaf_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for src in &self.leaves {
            for dst in &self.leaves {
                if src.name != dst.name {
                    pairs.push((src.name.clone(), dst.name.clone()));
                }
            }
        }
        pairs
    }

    /// Every directed path in the fabric: one per ordered leaf pair
    /// and spine.
    pub fn directed_paths(&self) -> Vec<PathKey> {
        let mut paths = Vec::new();
        for (src, dst) in self.ordered_leaf_pairs() {
            for spine in &self.spines {
                paths.push(PathKey::new(&src, &spine.name, &dst));
            }
        }
        paths
    }
}

/// Canned topologies for tests and local simulation.
pub mod testutil {
    use super::*;

    /// Two-spine, two-leaf fabric with one host per leaf.
    pub fn two_leaf() -> Topology {
        Topology {
            spines: vec![
                SpineDef {
                    name: "spine0".into(),
                    dpid: 0x100,
                    downlinks: [("leaf1".to_string(), 1), ("leaf6".to_string(), 2)]
                        .into_iter()
                        .collect(),
                },
                SpineDef {
                    name: "spine1".into(),
                    dpid: 0x101,
                    downlinks: [("leaf1".to_string(), 1), ("leaf6".to_string(), 2)]
                        .into_iter()
                        .collect(),
                },
            ],
            leaves: vec![
                LeafDef {
                    name: "leaf1".into(),
                    dpid: 0x1,
                    uplinks: [("spine0".to_string(), 1), ("spine1".to_string(), 2)]
                        .into_iter()
                        .collect(),
                    hosts: [("10.1.0.2".to_string(), 3)].into_iter().collect(),
                },
                LeafDef {
                    name: "leaf6".into(),
                    dpid: 0x6,
                    uplinks: [("spine0".to_string(), 1), ("spine1".to_string(), 2)]
                        .into_iter()
                        .collect(),
                    hosts: [("10.6.0.2".to_string(), 3)].into_iter().collect(),
                },
            ],
        }
    }
}
