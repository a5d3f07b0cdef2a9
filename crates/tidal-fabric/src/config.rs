//! Fabric selector configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use tidal_common::topology::Topology;

#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    /// Packet-in webhook listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SDN controller REST base URL (flow-entry install).
    #[serde(default = "default_controller_url")]
    pub controller_url: String,

    /// Where the central controller ships the weight document.
    #[serde(default = "default_weights_path")]
    pub weights_path: PathBuf,

    #[serde(default = "default_reload_check_secs")]
    pub reload_check_secs: u64,

    /// Idle timeout for installed flow rules and the sticky cache.
    #[serde(default = "default_rule_idle_timeout_secs")]
    pub rule_idle_timeout_secs: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,

    #[serde(default = "default_journal_cap")]
    pub journal_cap: usize,

    pub topology: Topology,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3100".to_string()
}
fn default_controller_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_weights_path() -> PathBuf {
    PathBuf::from("/var/lib/tidal/path_selection.json")
}
fn default_reload_check_secs() -> u64 {
    5
}
fn default_rule_idle_timeout_secs() -> u64 {
    300
}
fn default_call_timeout_secs() -> u64 {
    10
}
fn default_journal_path() -> PathBuf {
    PathBuf::from("/var/lib/tidal/fabric-alerts.json")
}
fn default_journal_cap() -> usize {
    500
}

impl FabricConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let body = std::fs::read_to_string(path)?;
        let config: FabricConfig = toml::from_str(&body)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.topology.spines.len() != 2 {
            anyhow::bail!(
                "fabric requires exactly 2 spines, got {}",
                self.topology.spines.len()
            );
        }
        if self.topology.leaves.len() < 2 {
            anyhow::bail!("fabric requires at least 2 leaves");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
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

    #[test]
    fn minimal_config_loads_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = FabricConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3100");
        assert_eq!(config.rule_idle_timeout_secs, 300);
        assert_eq!(config.topology.leaves.len(), 2);
        assert_eq!(config.topology.leaves[0].hosts["10.1.0.2"], 3);
    }

    #[test]
    fn wrong_spine_count_is_rejected() {
        let trimmed = MINIMAL.replace(
            "[[topology.spines]]\nname = \"spine1\"\ndpid = 257\n[topology.spines.downlinks]\nleaf1 = 1\nleaf6 = 2\n",
            "",
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(trimmed.as_bytes()).unwrap();
        assert!(FabricConfig::load(file.path()).is_err());
    }
}
