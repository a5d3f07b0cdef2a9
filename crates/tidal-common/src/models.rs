//! Data models for the tidal platform.
//!
//! These types are shared between the central controller (which writes
//! them) and the edge / fabric components (which consume read-only
//! replicas shipped as JSON documents).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Capacity tiers ──────────────────────────────────────────────────

/// One of the three pre-declared capacity classes. Higher tiers map to
/// larger forecast-demand intervals and bigger machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    T1,
    T2,
    T3,
}

impl Tier {
    /// The next tier up, or `None` at the top of the ladder.
    pub fn up(self) -> Option<Tier> {
        match self {
            Tier::T1 => Some(Tier::T2),
            Tier::T2 => Some(Tier::T3),
            Tier::T3 => None,
        }
    }

    /// The next tier down, or `None` at the bottom.
    pub fn down(self) -> Option<Tier> {
        match self {
            Tier::T1 => None,
            Tier::T2 => Some(Tier::T1),
            Tier::T3 => Some(Tier::T2),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::T1 => write!(f, "tier-1"),
            Tier::T2 => write!(f, "tier-2"),
            Tier::T3 => write!(f, "tier-3"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" | "t1" | "tier-1" => Ok(Tier::T1),
            "2" | "t2" | "tier-2" => Ok(Tier::T2),
            "3" | "t3" | "tier-3" => Ok(Tier::T3),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

// ── Backends ────────────────────────────────────────────────────────

/// Static descriptor of a backend VM. Never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    /// IP address the NAT forwards to and the health checker probes.
    pub address: String,
    /// Hypervisor domain name used for power actuation.
    pub vm_name: String,
    pub tier: Tier,
    pub capacity_cores: u32,
    pub capacity_memory_bytes: u64,
}

/// Mutable scheduling state of a backend. The central controller owns
/// the authoritative copy; the edge reads a replica from the status
/// document. Invariant: `draining` implies `active`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendState {
    pub active: bool,
    pub draining: bool,
    pub healthy: bool,
}

impl BackendState {
    /// State of a powered-on, schedulable backend.
    pub fn online() -> Self {
        Self {
            active: true,
            draining: false,
            healthy: true,
        }
    }

    /// Whether the edge may route traffic to this backend.
    pub fn schedulable(&self) -> bool {
        self.active && !self.draining && self.healthy
    }
}

/// A normalised telemetry sample for one backend, assembled from the
/// metrics DB. `fresh = false` means the sample was missing or older
/// than one poll interval; such backends are treated as unreachable
/// for scheduling purposes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LiveSample {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub rps: f64,
    pub total_memory_bytes: u64,
    pub total_cpu_cores: u32,
    pub fresh: bool,
}

impl LiveSample {
    /// Placeholder for a backend the metrics DB knows nothing about.
    pub fn stale() -> Self {
        Self {
            cpu_pct: 0.0,
            memory_pct: 0.0,
            rps: 0.0,
            total_memory_bytes: 0,
            total_cpu_cores: 0,
            fresh: false,
        }
    }
}

// ── Forecast ────────────────────────────────────────────────────────

/// A cached demand forecast in requests per hour. A fresh forecast is
/// produced at most once per natural clock hour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Forecast {
    pub value: f64,
    pub valid_until: DateTime<Utc>,
}

impl Forecast {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until > now
    }
}

// ── Status document ─────────────────────────────────────────────────

/// One entry of the on-disk server-status document, keyed by backend
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub name: String,
    pub ip: String,
    pub active: bool,
    pub draining: bool,
    pub healthy: bool,
}

/// The authoritative server-status document. Single-writer (central),
/// single-reader (edge). `BTreeMap` keeps the serialized form stable.
pub type StatusDocument = BTreeMap<String, StatusEntry>;

// ── Fabric paths ────────────────────────────────────────────────────

/// A directed path through the spine-leaf fabric: traffic enters at
/// `src_leaf`, crosses exactly one `spine`, and exits at `dst_leaf`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    pub src_leaf: String,
    pub spine: String,
    pub dst_leaf: String,
}

impl PathKey {
    pub fn new(src_leaf: &str, spine: &str, dst_leaf: &str) -> Self {
        Self {
            src_leaf: src_leaf.to_string(),
            spine: spine.to_string(),
            dst_leaf: dst_leaf.to_string(),
        }
    }

    /// Document key for the directed route this path belongs to.
    pub fn route_key(&self) -> String {
        format!("{}->{}", self.src_leaf, self.dst_leaf)
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.src_leaf, self.spine, self.dst_leaf)
    }
}

// ── Path-selection document ─────────────────────────────────────────

/// How route weights are derived from fabric telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMode {
    /// Weights follow observed bytes directly (cold start).
    Realtime,
    /// Weights follow per-path model predictions.
    Prediction,
    /// 30 % prediction + 70 % observation.
    Hybrid,
}

impl std::fmt::Display for LoadBalancingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancingMode::Realtime => write!(f, "realtime"),
            LoadBalancingMode::Prediction => write!(f, "prediction"),
            LoadBalancingMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Where a path's bandwidth cost figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    Observed,
    Predicted,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthCost {
    pub bytes: f64,
    pub megabytes: f64,
    pub source: CostSource,
}

impl BandwidthCost {
    pub fn new(bytes: f64, source: CostSource) -> Self {
        Self {
            bytes,
            megabytes: bytes / 1_000_000.0,
            source,
        }
    }
}

/// One selectable path within a route entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathDetail {
    pub via_spine: String,
    pub selection_ratio: f64,
    pub bandwidth_cost: BandwidthCost,
}

/// The two paths of a directed route, keyed `"path_0"` / `"path_1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub path_details: BTreeMap<String, PathDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Wall-clock timestamp rendered in UTC+8, the fabric operators'
    /// local zone.
    pub timestamp_utc8: String,
    pub iteration: u64,
    pub load_balancing_mode: LoadBalancingMode,
    pub using_predictions: bool,
    pub description: String,
}

/// The path-selection document published to the SDN controller host.
/// Consumers read it atomically; a reload replaces all weights at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSelectionDocument {
    pub metadata: DocumentMetadata,
    pub path_selection_weights: BTreeMap<String, RouteEntry>,
}

impl PathSelectionDocument {
    /// Look up `(ratio_path0, ratio_path1)` for a directed route key,
    /// along with the spine each path crosses.
    pub fn route_ratios(&self, route: &str) -> Option<[(String, f64); 2]> {
        let entry = self.path_selection_weights.get(route)?;
        let p0 = entry.path_details.get("path_0")?;
        let p1 = entry.path_details.get("path_1")?;
        Some([
            (p0.via_spine.clone(), p0.selection_ratio),
            (p1.via_spine.clone(), p1.selection_ratio),
        ])
    }
}
