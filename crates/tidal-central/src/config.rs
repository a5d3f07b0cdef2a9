//! Central controller configuration.
//!
//! One TOML file describes the backend pool, the tier ladder, the
//! external endpoints, and both loops' cadences. Loading happens once
//! at startup; failure is fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use tidal_common::models::{Backend, Tier};
use tidal_common::topology::Topology;

use crate::capacity::{CapacitySettings, TierLadder};
use crate::paths::runner::{ModePolicy, PathLoopSettings};
use crate::status::{DocumentShipper, LocalCopyShipper, ScpShipper};

#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    #[serde(default = "default_api_listen_addr")]
    pub api_listen_addr: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Capacity loop tick in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Per-call timeout for external I/O.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_journal_cap")]
    pub journal_cap: usize,

    /// Status re-ship heartbeat in seconds (at most one per minute).
    #[serde(default = "default_status_heartbeat_secs")]
    pub status_heartbeat_secs: u64,

    pub metrics: MetricsConfig,
    pub traffic_db: TrafficDbConfig,

    #[serde(default)]
    pub tiers: TiersConfig,

    #[serde(default)]
    pub capacity: CapacityConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub power: PowerConfig,

    pub status_sync: ShipConfig,
    pub paths: PathsConfig,

    pub backends: Vec<BackendConfig>,
    pub topology: Topology,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub url: String,
    #[serde(default = "default_sample_max_age_secs")]
    pub sample_max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficDbConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    /// Forecast (requests/hour) at which tier 2 takes over.
    pub upgrade_t2: f64,
    /// Forecast at which tier 3 takes over.
    pub upgrade_t3: f64,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            upgrade_t2: 100_000.0,
            upgrade_t3: 250_000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub stabilize_secs: u64,
    pub drain_secs: u64,
    pub overload_window_secs: u64,
    pub idle_window_secs: u64,
    pub overload_cpu_pct: f64,
    pub overload_mem_pct: f64,
    pub idle_cpu_pct: f64,
    pub idle_mem_pct: f64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            stabilize_secs: 80,
            drain_secs: 30,
            overload_window_secs: 300,
            idle_window_secs: 1800,
            overload_cpu_pct: 90.0,
            overload_mem_pct: 90.0,
            idle_cpu_pct: 3.0,
            idle_mem_pct: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_port: u16,
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_port: 80,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub virsh_binary: String,
    pub connect_uri: String,
    pub timeout_secs: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            virsh_binary: "virsh".to_string(),
            connect_uri: "qemu:///system".to_string(),
            timeout_secs: 30,
        }
    }
}

/// How a document leaves this host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ShipConfig {
    /// `scp` to a remote path, e.g. `edge:/var/lib/tidal/status.json`.
    Scp { target: String },
    /// Plain copy for colocated consumers.
    Copy { target: PathBuf },
}

impl ShipConfig {
    pub fn build(&self) -> Box<dyn DocumentShipper> {
        match self {
            ShipConfig::Scp { target } => Box::new(ScpShipper {
                target: target.clone(),
            }),
            ShipConfig::Copy { target } => Box::new(LocalCopyShipper {
                dest: target.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// SDN controller REST base URL.
    pub sdn_url: String,
    pub ship: ShipConfig,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// `auto`, `realtime`, `prediction`, or `hybrid`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_min_windows")]
    pub min_windows: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub address: String,
    pub vm_name: String,
    /// 1, 2, or 3.
    pub tier: u8,
    pub capacity_cores: u32,
    pub capacity_memory_bytes: u64,
}

fn default_api_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/tidal")
}
fn default_tick_secs() -> u64 {
    10
}
fn default_call_timeout_secs() -> u64 {
    10
}
fn default_journal_cap() -> usize {
    1000
}
fn default_status_heartbeat_secs() -> u64 {
    60
}
fn default_sample_max_age_secs() -> u64 {
    15
}
fn default_window_secs() -> u64 {
    60
}
fn default_epsilon() -> f64 {
    1.0
}
fn default_mode() -> String {
    "auto".to_string()
}
fn default_min_windows() -> usize {
    10
}

impl CentralConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let body = std::fs::read_to_string(path)?;
        let config: CentralConfig = toml::from_str(&body)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("at least one backend must be configured");
        }
        for backend in &self.backends {
            if !(1..=3).contains(&backend.tier) {
                anyhow::bail!("backend {} has invalid tier {}", backend.id, backend.tier);
            }
        }
        if self.tiers.upgrade_t2 >= self.tiers.upgrade_t3 {
            anyhow::bail!("tier boundaries must be strictly increasing");
        }
        self.mode_policy()?;
        if self.topology.spines.len() != 2 {
            anyhow::bail!(
                "fabric requires exactly 2 spines, got {}",
                self.topology.spines.len()
            );
        }
        Ok(())
    }

    pub fn to_backends(&self) -> Vec<Backend> {
        self.backends
            .iter()
            .map(|b| Backend {
                id: b.id.clone(),
                address: b.address.clone(),
                vm_name: b.vm_name.clone(),
                tier: match b.tier {
                    1 => Tier::T1,
                    2 => Tier::T2,
                    _ => Tier::T3,
                },
                capacity_cores: b.capacity_cores,
                capacity_memory_bytes: b.capacity_memory_bytes,
            })
            .collect()
    }

    pub fn ladder(&self) -> TierLadder {
        TierLadder {
            upgrade_t2: self.tiers.upgrade_t2,
            upgrade_t3: self.tiers.upgrade_t3,
        }
    }

    pub fn capacity_settings(&self) -> CapacitySettings {
        CapacitySettings {
            stabilize: Duration::from_secs(self.capacity.stabilize_secs),
            drain: Duration::from_secs(self.capacity.drain_secs),
            tick: Duration::from_secs(self.tick_secs),
            overload_window: Duration::from_secs(self.capacity.overload_window_secs),
            idle_window: Duration::from_secs(self.capacity.idle_window_secs),
            overload_cpu: self.capacity.overload_cpu_pct,
            overload_mem: self.capacity.overload_mem_pct,
            idle_cpu: self.capacity.idle_cpu_pct,
            idle_mem: self.capacity.idle_mem_pct,
        }
    }

    pub fn mode_policy(&self) -> anyhow::Result<ModePolicy> {
        use tidal_common::models::LoadBalancingMode::*;
        match self.paths.mode.as_str() {
            "auto" => Ok(ModePolicy::Auto),
            "realtime" => Ok(ModePolicy::Fixed(Realtime)),
            "prediction" => Ok(ModePolicy::Fixed(Prediction)),
            "hybrid" => Ok(ModePolicy::Fixed(Hybrid)),
            other => anyhow::bail!("unknown load balancing mode: {other}"),
        }
    }

    pub fn path_loop_settings(&self) -> anyhow::Result<PathLoopSettings> {
        Ok(PathLoopSettings {
            window: Duration::from_secs(self.paths.window_secs),
            epsilon: self.paths.epsilon,
            mode: self.mode_policy()?,
            min_windows: self.paths.min_windows,
            weights_local: self.state_dir.join("path_selection.json"),
            history_path: self.state_dir.join("path-history.json"),
            predictions_path: self.state_dir.join("daily-predictions.json"),
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[metrics]
url = "http://prom:9090"

[traffic_db]
url = "http://traffic:8000"

[status_sync]
mode = "scp"
target = "edge:/var/lib/tidal/status.json"

[paths]
sdn_url = "http://sdn:8080"

[paths.ship]
mode = "copy"
target = "/var/lib/tidal/shipped/path_selection.json"

[[backends]]
id = "web-t1"
address = "10.0.1.11"
vm_name = "web-t1"
tier = 1
capacity_cores = 2
capacity_memory_bytes = 4294967296

[[backends]]
id = "web-t2"
address = "10.0.1.12"
vm_name = "web-t2"
tier = 2
capacity_cores = 4
capacity_memory_bytes = 8589934592

[[topology.spines]]
name = "spine0"
dpid = 256
[topology.spines.downlinks]
leaf1 = 1
leaf6 = 2

[[topology.spines]]
name = "spine1"
dpid = 257
[topology.spines.downlinks]
leaf1 = 1
leaf6 = 2

[[topology.leaves]]
name = "leaf1"
dpid = 1
[topology.leaves.uplinks]
spine0 = 1
spine1 = 2
[topology.leaves.hosts]
"10.1.0.2" = 3

[[topology.leaves]]
name = "leaf6"
dpid = 6
[topology.leaves.uplinks]
spine0 = 1
spine1 = 2
[topology.leaves.hosts]
"10.6.0.2" = 3
"#;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_documented_defaults() {
        let file = write_config(MINIMAL);
        let config = CentralConfig::load(file.path()).unwrap();

        assert_eq!(config.tick_secs, 10);
        assert_eq!(config.tiers.upgrade_t2, 100_000.0);
        assert_eq!(config.capacity.stabilize_secs, 80);
        assert_eq!(config.capacity.drain_secs, 30);
        assert_eq!(config.paths.window_secs, 60);
        assert_eq!(config.paths.min_windows, 10);

        let backends = config.to_backends();
        assert_eq!(backends[0].tier, Tier::T1);
        assert_eq!(backends[1].tier, Tier::T2);
        assert!(matches!(config.mode_policy().unwrap(), ModePolicy::Auto));
    }

    #[test]
    fn invalid_tier_is_rejected() {
        let body = MINIMAL.replace("tier = 2", "tier = 9");
        let file = write_config(&body);
        assert!(CentralConfig::load(file.path()).is_err());
    }

    #[test]
    fn empty_backend_list_is_rejected() {
        let body = MINIMAL
            .replace("[[backends]]", "[[ignored]]")
            .replace("tier = 1", "x1 = 1")
            .replace("tier = 2", "x2 = 2");
        let file = write_config(&body);
        assert!(CentralConfig::load(file.path()).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let body = MINIMAL.replace(
            "[paths]\nsdn_url = \"http://sdn:8080\"",
            "[paths]\nsdn_url = \"http://sdn:8080\"\nmode = \"psychic\"",
        );
        let file = write_config(&body);
        assert!(CentralConfig::load(file.path()).is_err());
    }
}
