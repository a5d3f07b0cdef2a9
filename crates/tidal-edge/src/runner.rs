//! Edge control loop.
//!
//! Every tick: reload the status replica shipped by the central
//! controller, build the candidate set, run DWRS, and commit the
//! chosen backend to the NAT dataplane. The loop never exits on
//! external failure — it degrades and retries next tick.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use tidal_common::alerts::AlertJournal;
use tidal_common::docstore;
use tidal_common::models::{LiveSample, StatusDocument};
use tidal_common::telemetry::MetricsClient;

use crate::nat::{DnatApplier, NatCommitter};
use crate::selector::{self, Candidate};

pub struct EdgeSettings {
    /// Where the central controller ships the status document.
    pub status_path: PathBuf,
    /// Service port of every backend (NAT target becomes `ip:port`).
    pub backend_port: u16,
    pub tick: Duration,
    /// Telemetry older than this is treated as missing.
    pub sample_max_age: Duration,
    /// A replica older than this must not drive selection.
    pub replica_stale_cap: Duration,
}

/// Build the DWRS candidate set from the status replica and live
/// telemetry: active, not draining, healthy, and fresh.
pub fn candidates_from(
    doc: &StatusDocument,
    samples: &HashMap<String, LiveSample>,
) -> Vec<Candidate> {
    doc.iter()
        .filter(|(_, entry)| entry.active && !entry.draining && entry.healthy)
        .filter_map(|(address, _)| {
            let sample = samples.get(address)?;
            sample.fresh.then(|| Candidate {
                address: address.clone(),
                sample: *sample,
            })
        })
        .collect()
}

/// Run the edge loop until shutdown.
pub async fn run<A: DnatApplier>(
    settings: EdgeSettings,
    metrics: MetricsClient,
    mut nat: NatCommitter<A>,
    journal: Arc<AlertJournal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(settings.tick);
    let mut replica: Option<(StatusDocument, Instant)> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("edge loop stopping");
                    return;
                }
            }
        }

        // ── Reload the status replica ───────────────────────────
        match docstore::read_json_retry::<StatusDocument>(&settings.status_path) {
            Ok(doc) => replica = Some((doc, Instant::now())),
            Err(e) => {
                journal.warning(
                    "edge",
                    "Status Replica Unreadable",
                    &format!("keeping last-known state: {e}"),
                );
            }
        }

        let Some((doc, loaded_at)) = &replica else {
            continue;
        };
        if loaded_at.elapsed() > settings.replica_stale_cap {
            // Too old to trust for scheduling; the installed NAT rule
            // stays as-is until a fresh replica arrives.
            journal.warning(
                "edge",
                "Status Replica Stale",
                "replica exceeded the staleness cap, skipping selection",
            );
            continue;
        }

        // ── Telemetry ───────────────────────────────────────────
        let addresses: Vec<&str> = doc.keys().map(String::as_str).collect();
        let samples = match metrics.live_samples(&addresses, settings.sample_max_age).await {
            Ok(samples) => samples,
            Err(e) => {
                journal.warning("edge", "Telemetry Unavailable", &format!("{e}"));
                continue;
            }
        };

        // ── Select and commit ───────────────────────────────────
        let candidates = candidates_from(doc, &samples);
        // The RNG handle is thread-local; keep it out of await scope.
        let chosen = {
            let mut rng = rand::rng();
            selector::pick(&candidates, &mut rng).cloned()
        };
        match chosen {
            Some(chosen) => {
                let target = format!("{}:{}", chosen.address, settings.backend_port);
                if let Err(e) = nat.commit(&target).await {
                    journal.critical(
                        "nat",
                        "NAT Commit Failed",
                        &format!("previous rule preserved: {e}"),
                    );
                }
            }
            None => {
                journal.warning(
                    "edge",
                    "No Candidate Backend",
                    "candidate set is empty; retaining previous NAT target",
                );
            }
        }
    }
}
