//! Single-destination DNAT commit.
//!
//! The edge box forwards the public endpoint to exactly one backend at
//! a time. Committing an unchanged target is a no-op; replacing the
//! target rewrites the one rule atomically (flush + add inside a
//! single `nft -f` transaction). A failed install leaves the previous
//! rule untouched.

use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Applies a replacement DNAT rule to the dataplane.
#[async_trait]
pub trait DnatApplier: Send + Sync {
    async fn apply(&self, target: &str) -> anyhow::Result<()>;
}

/// nftables-backed applier. The table/chain are expected to exist
/// (created at provisioning time); each apply rewrites the chain's
/// single rule in one transaction.
pub struct NftApplier {
    pub table: String,
    pub chain: String,
    /// Public "ip:port" the NAT listens on.
    pub public_endpoint: String,
}

#[async_trait]
impl DnatApplier for NftApplier {
    async fn apply(&self, target: &str) -> anyhow::Result<()> {
        let (public_ip, public_port) = self
            .public_endpoint
            .split_once(':')
            .context("public endpoint must be ip:port")?;

        let script = format!(
            "flush chain ip {table} {chain}\n\
             add rule ip {table} {chain} ip daddr {public_ip} tcp dport {public_port} dnat to {target}\n",
            table = self.table,
            chain = self.chain,
        );

        let mut child = Command::new("nft")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn nft")?;

        child
            .stdin
            .take()
            .context("nft stdin unavailable")?
            .write_all(script.as_bytes())
            .await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "nft exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Outcome of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Installed,
    Unchanged,
}

/// Tracks the currently installed target and skips redundant installs.
pub struct NatCommitter<A: DnatApplier> {
    applier: A,
    current: Option<String>,
    installs: u64,
}

impl<A: DnatApplier> NatCommitter<A> {
    pub fn new(applier: A) -> Self {
        Self {
            applier,
            current: None,
            installs: 0,
        }
    }

    /// Commit `target` as the NAT destination. Returns `Unchanged`
    /// without touching the dataplane when the target is already
    /// installed. On failure the previously installed rule (and the
    /// tracked target) are preserved.
    pub async fn commit(&mut self, target: &str) -> anyhow::Result<CommitOutcome> {
        if self.current.as_deref() == Some(target) {
            return Ok(CommitOutcome::Unchanged);
        }
        self.applier.apply(target).await?;
        self.current = Some(target.to_string());
        self.installs += 1;
        tracing::info!(target, installs = self.installs, "NAT target replaced");
        Ok(CommitOutcome::Installed)
    }

    /// The currently installed target, if any.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Number of dataplane installs performed (excludes no-ops).
    pub fn installs(&self) -> u64 {
        self.installs
    }
}
