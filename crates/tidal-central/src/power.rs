//! Hypervisor power actuation.
//!
//! One invocation per VM: power on, graceful power off, or hard
//! reset, executed against a libvirt-style hypervisor. Invocations
//! are idempotent — asking a running domain to start (or a stopped
//! one to shut down) is treated as success.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    HardReset,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::On => write!(f, "on"),
            PowerAction::Off => write!(f, "off"),
            PowerAction::HardReset => write!(f, "restart"),
        }
    }
}

#[async_trait]
pub trait PowerActuator: Send + Sync {
    async fn set_power(&self, vm_name: &str, action: PowerAction) -> anyhow::Result<()>;
}

/// `virsh`-based actuator.
pub struct VirshActuator {
    pub binary: String,
    pub connect_uri: String,
    pub timeout: Duration,
}

impl VirshActuator {
    fn subcommand(action: PowerAction) -> &'static str {
        match action {
            PowerAction::On => "start",
            PowerAction::Off => "shutdown",
            PowerAction::HardReset => "reset",
        }
    }

    /// stderr lines that mean the domain is already in the requested
    /// state; the actuation contract is idempotent.
    fn already_satisfied(action: PowerAction, stderr: &str) -> bool {
        match action {
            PowerAction::On => stderr.contains("already active"),
            PowerAction::Off => {
                stderr.contains("not running") || stderr.contains("domain is not running")
            }
            PowerAction::HardReset => false,
        }
    }
}

#[async_trait]
impl PowerActuator for VirshActuator {
    async fn set_power(&self, vm_name: &str, action: PowerAction) -> anyhow::Result<()> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-c")
                .arg(&self.connect_uri)
                .arg(Self::subcommand(action))
                .arg(vm_name)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("power actuation timed out after {:?}", self.timeout))??;

        if output.status.success() {
            tracing::info!(vm = %vm_name, action = %action, "power actuation complete");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if Self::already_satisfied(action, &stderr) {
            tracing::debug!(vm = %vm_name, action = %action, "domain already in requested state");
            return Ok(());
        }
        anyhow::bail!(
            "virsh {} {vm_name} failed: {}",
            Self::subcommand(action),
            stderr.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotence_matches_known_stderr() {
        assert!(VirshActuator::already_satisfied(
            PowerAction::On,
            "error: Domain is already active"
        ));
        assert!(VirshActuator::already_satisfied(
            PowerAction::Off,
            "error: Requested operation is not valid: domain is not running"
        ));
        assert!(!VirshActuator::already_satisfied(
            PowerAction::HardReset,
            "error: anything"
        ));
        assert!(!VirshActuator::already_satisfied(
            PowerAction::On,
            "error: failed to connect to the hypervisor"
        ));
    }

    #[test]
    fn subcommands_map_to_virsh_verbs() {
        assert_eq!(VirshActuator::subcommand(PowerAction::On), "start");
        assert_eq!(VirshActuator::subcommand(PowerAction::Off), "shutdown");
        assert_eq!(VirshActuator::subcommand(PowerAction::HardReset), "reset");
    }
}
