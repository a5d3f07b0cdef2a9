//! Status document build, atomic write, and edge sync.
//!
//! The central controller is the single writer: on every backend
//! state transition the document is rewritten locally (atomic rename)
//! and shipped to the edge controller's expected path. Shipping is
//! best-effort — the local copy is the truth and a heartbeat re-ships
//! at most once a minute.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use tidal_common::backoff;
use tidal_common::docstore;
use tidal_common::models::{Backend, BackendState, StatusDocument, StatusEntry};

/// Assemble the on-disk document from static descriptors and live
/// scheduling state, keyed by backend address.
pub fn build_document(
    backends: &[Backend],
    states: &BTreeMap<String, BackendState>,
) -> StatusDocument {
    let mut doc = StatusDocument::new();
    for backend in backends {
        let Some(state) = states.get(&backend.id) else {
            continue;
        };
        doc.insert(
            backend.address.clone(),
            StatusEntry {
                name: backend.id.clone(),
                ip: backend.address.clone(),
                active: state.active,
                draining: state.draining,
                healthy: state.healthy,
            },
        );
    }
    doc
}

/// Transports a freshly written document to a consumer host.
#[async_trait]
pub trait DocumentShipper: Send + Sync {
    async fn ship(&self, local: &Path) -> anyhow::Result<()>;
}

/// `scp` transport for remote consumers (edge box, SDN host).
pub struct ScpShipper {
    /// Remote target in scp syntax, e.g. `edge:/var/lib/tidal/status.json`.
    pub target: String,
}

#[async_trait]
impl DocumentShipper for ScpShipper {
    async fn ship(&self, local: &Path) -> anyhow::Result<()> {
        let output = Command::new("scp")
            .arg("-q")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg(local)
            .arg(&self.target)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "scp to {} failed: {}",
                self.target,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Plain file copy for colocated consumers and development setups.
pub struct LocalCopyShipper {
    pub dest: PathBuf,
}

#[async_trait]
impl DocumentShipper for LocalCopyShipper {
    async fn ship(&self, local: &Path) -> anyhow::Result<()> {
        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Copy through a sibling temp file so the consumer's reader
        // never sees a half-written document.
        let tmp = self.dest.with_extension("tmp");
        tokio::fs::copy(local, &tmp).await?;
        tokio::fs::rename(&tmp, &self.dest).await?;
        Ok(())
    }
}

/// Writes the authoritative document and keeps the edge replica in
/// sync, with a heartbeat re-ship for lost updates.
pub struct StatusSyncer {
    local_path: PathBuf,
    shipper: Box<dyn DocumentShipper>,
    heartbeat: Duration,
    last_ship_attempt: Option<Instant>,
    last_written: Option<StatusDocument>,
}

impl StatusSyncer {
    pub fn new(local_path: PathBuf, shipper: Box<dyn DocumentShipper>, heartbeat: Duration) -> Self {
        Self {
            local_path,
            shipper,
            heartbeat,
            last_ship_attempt: None,
            last_written: None,
        }
    }

    /// Write and ship if the document changed, or if the heartbeat
    /// interval has elapsed since the last ship attempt. Returns an
    /// error only for the local write — ship failures degrade to a
    /// warning-level result for the caller to log.
    pub async fn sync(&mut self, doc: &StatusDocument) -> anyhow::Result<ShipOutcome> {
        let changed = self.last_written.as_ref() != Some(doc);
        let heartbeat_due = self
            .last_ship_attempt
            .is_none_or(|t| t.elapsed() >= self.heartbeat);
        if !changed && !heartbeat_due {
            return Ok(ShipOutcome::Skipped);
        }

        if changed {
            docstore::write_json_atomic(&self.local_path, doc)?;
            self.last_written = Some(doc.clone());
        }

        self.last_ship_attempt = Some(Instant::now());
        let result = backoff::retry(
            backoff::DEFAULT_ATTEMPTS,
            Duration::from_millis(500),
            || self.shipper.ship(&self.local_path),
        )
        .await;
        match result {
            Ok(()) => Ok(ShipOutcome::Shipped),
            Err(e) => Ok(ShipOutcome::ShipFailed(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipOutcome {
    Shipped,
    /// Nothing changed and no heartbeat was due.
    Skipped,
    /// Local write succeeded; the transport failed and will be
    /// retried on the next transition or heartbeat.
    ShipFailed(String),
}
