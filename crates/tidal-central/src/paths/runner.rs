//! The path loop: collect → predict → weigh → publish.
//!
//! Runs once per 60-second window. Counter collection failures skip
//! the window (warning), counter regressions zero the affected paths,
//! and publication failures leave the local document authoritative
//! for the next heartbeat or a manual `force_sync`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use tidal_common::backoff;
use tidal_common::docstore;
use tidal_common::models::{CostSource, LoadBalancingMode};
use tidal_common::topology::Topology;

use crate::paths::collector::{PathCollector, PortStatsSource};
use crate::paths::predictor::PredictorBank;
use crate::paths::weights::{self, PathCost};
use crate::state::{AppState, SyncReply};
use crate::status::DocumentShipper;

/// How route weights are sourced, from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePolicy {
    /// Realtime until every path has enough history, then prediction.
    Auto,
    Fixed(LoadBalancingMode),
}

/// Resolve the operating mode for this window. Prediction-based modes
/// need the cold-start history; until then the loop stays realtime.
pub fn mode_for(policy: ModePolicy, ready: bool) -> LoadBalancingMode {
    match (policy, ready) {
        (ModePolicy::Fixed(LoadBalancingMode::Realtime), _) => LoadBalancingMode::Realtime,
        (_, false) => LoadBalancingMode::Realtime,
        (ModePolicy::Auto, true) => LoadBalancingMode::Prediction,
        (ModePolicy::Fixed(mode), true) => mode,
    }
}

/// The byte cost a path contributes to weight derivation under `mode`.
pub fn effective(mode: LoadBalancingMode, observed: f64, predicted: f64) -> (f64, CostSource) {
    match mode {
        LoadBalancingMode::Realtime => (observed, CostSource::Observed),
        LoadBalancingMode::Prediction => (predicted, CostSource::Predicted),
        LoadBalancingMode::Hybrid => {
            (0.3 * predicted + 0.7 * observed, CostSource::Hybrid)
        }
    }
}

pub struct PathLoopSettings {
    pub window: Duration,
    pub epsilon: f64,
    pub mode: ModePolicy,
    pub min_windows: usize,
    pub weights_local: PathBuf,
    pub history_path: PathBuf,
    pub predictions_path: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PredictionRecord {
    timestamp: chrono::DateTime<Utc>,
    path: String,
    predicted_bytes: f64,
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct PredictionsLog {
    date: String,
    records: Vec<PredictionRecord>,
}

const PREDICTIONS_CAP: usize = 4096;

pub struct PathLoop {
    settings: PathLoopSettings,
    topo: Topology,
    collector: PathCollector,
    bank: PredictorBank,
    stats_source: Box<dyn PortStatsSource>,
    shipper: Box<dyn DocumentShipper>,
    state: AppState,
    iteration: u64,
    predictions: PredictionsLog,
}

impl PathLoop {
    pub fn new(
        settings: PathLoopSettings,
        topo: Topology,
        stats_source: Box<dyn PortStatsSource>,
        shipper: Box<dyn DocumentShipper>,
        state: AppState,
    ) -> Self {
        let bank = PredictorBank::new(topo.directed_paths(), settings.min_windows);
        let predictions: PredictionsLog =
            docstore::read_json(&settings.predictions_path).unwrap_or_default();
        Self {
            collector: PathCollector::new(topo.clone()),
            bank,
            topo,
            stats_source,
            shipper,
            state,
            iteration: 0,
            predictions,
            settings,
        }
    }

    pub async fn run(
        mut self,
        mut force_sync_rx: mpsc::Receiver<SyncReply>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.settings.window);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                Some(reply) = force_sync_rx.recv() => {
                    let result = self.ship_current().await;
                    let _ = reply.send(result);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("path loop stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&mut self) {
        // ── Collect ─────────────────────────────────────────────
        let counters = match backoff::retry(
            backoff::DEFAULT_ATTEMPTS,
            Duration::from_millis(500),
            || self.collector.fetch(&*self.stats_source),
        )
        .await
        {
            Ok(counters) => counters,
            Err(e) => {
                self.state.journal().warning(
                    "fabric",
                    "Port Statistics Unavailable",
                    &format!("skipping window: {e}"),
                );
                return;
            }
        };
        let now = Utc::now();
        self.state.record_collection(now);

        let Some(outcome) = self.collector.ingest(counters) else {
            tracing::debug!("counter deltas primed, first window skipped");
            return;
        };
        for regression in &outcome.regressions {
            self.state
                .journal()
                .warning("fabric", "Counter Regression", regression);
        }

        // ── Predict ─────────────────────────────────────────────
        self.bank.observe(&outcome.windows);
        let mode = mode_for(self.settings.mode, self.bank.ready());
        let using_predictions = mode != LoadBalancingMode::Realtime;

        let mut routes = BTreeMap::new();
        for (src, dst) in self.topo.ordered_leaf_pairs() {
            let mut costs = Vec::with_capacity(2);
            for spine in &self.topo.spines {
                let path = tidal_common::models::PathKey::new(&src, &spine.name, &dst);
                let observed = self.bank.last_observed(&path);
                // Predict every window regardless of mode so the
                // accuracy metric keeps settling.
                let predicted = self.bank.predict(&path);
                Self::log_prediction(&mut self.predictions, now, &path.to_string(), predicted);
                let (bytes, source) = effective(mode, observed, predicted);
                costs.push(PathCost {
                    via_spine: spine.name.clone(),
                    bytes,
                    source,
                });
            }
            let [c0, c1] = <[PathCost; 2]>::try_from(costs).expect("two spines per route");
            routes.insert(format!("{src}->{dst}"), [c0, c1]);
        }

        // ── Publish ─────────────────────────────────────────────
        self.iteration += 1;
        let doc = weights::build_document(
            self.iteration,
            mode,
            using_predictions,
            &routes,
            self.settings.epsilon,
            now,
        );

        if let Err(e) = docstore::write_json_atomic(&self.settings.weights_local, &doc) {
            self.state.journal().warning(
                "fabric",
                "Weight Document Write Failed",
                &format!("window dropped: {e}"),
            );
            return;
        }
        self.state.store_weights(doc);
        self.state.set_accuracies(self.bank.accuracies());
        self.persist_side_state();

        let shipped = backoff::retry(
            backoff::DEFAULT_ATTEMPTS,
            Duration::from_millis(500),
            || self.shipper.ship(&self.settings.weights_local),
        )
        .await;
        self.state.record_push(Utc::now(), shipped.is_ok());
        match shipped {
            Ok(()) => {
                tracing::info!(iteration = self.iteration, mode = %mode, "path weights published");
            }
            Err(e) => {
                self.state.journal().warning(
                    "fabric",
                    "Weight Push Failed",
                    &format!("local document remains authoritative: {e}"),
                );
            }
        }
    }

    /// Re-ship the current document (manual resync).
    async fn ship_current(&mut self) -> anyhow::Result<()> {
        if self.state.weights().is_none() {
            anyhow::bail!("no weight document published yet");
        }
        let result = self.shipper.ship(&self.settings.weights_local).await;
        self.state.record_push(Utc::now(), result.is_ok());
        result
    }

    fn log_prediction(
        predictions: &mut PredictionsLog,
        now: chrono::DateTime<Utc>,
        path: &str,
        predicted: f64,
    ) {
        let today = now.format("%Y-%m-%d").to_string();
        if predictions.date != today {
            predictions.date = today;
            predictions.records.clear();
        }
        predictions.records.push(PredictionRecord {
            timestamp: now,
            path: path.to_string(),
            predicted_bytes: predicted,
        });
        if predictions.records.len() > PREDICTIONS_CAP {
            let excess = predictions.records.len() - PREDICTIONS_CAP;
            predictions.records.drain(..excess);
        }
    }

    fn persist_side_state(&self) {
        if let Err(e) =
            docstore::write_json_atomic(&self.settings.history_path, &self.bank.history_snapshot())
        {
            tracing::warn!(error = %e, "failed to persist path history");
        }
        if let Err(e) =
            docstore::write_json_atomic(&self.settings.predictions_path, &self.predictions)
        {
            tracing::warn!(error = %e, "failed to persist prediction log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_forces_realtime() {
        assert_eq!(mode_for(ModePolicy::Auto, false), LoadBalancingMode::Realtime);
        assert_eq!(
            mode_for(ModePolicy::Fixed(LoadBalancingMode::Prediction), false),
            LoadBalancingMode::Realtime
        );
        assert_eq!(
            mode_for(ModePolicy::Fixed(LoadBalancingMode::Hybrid), false),
            LoadBalancingMode::Realtime
        );
    }

    #[test]
    fn ready_history_activates_the_configured_mode() {
        assert_eq!(mode_for(ModePolicy::Auto, true), LoadBalancingMode::Prediction);
        assert_eq!(
            mode_for(ModePolicy::Fixed(LoadBalancingMode::Hybrid), true),
            LoadBalancingMode::Hybrid
        );
        assert_eq!(
            mode_for(ModePolicy::Fixed(LoadBalancingMode::Realtime), true),
            LoadBalancingMode::Realtime
        );
    }

    #[test]
    fn effective_cost_follows_the_mode() {
        let (bytes, source) = effective(LoadBalancingMode::Realtime, 7e6, 9e6);
        assert_eq!(bytes, 7e6);
        assert_eq!(source, CostSource::Observed);

        let (bytes, source) = effective(LoadBalancingMode::Prediction, 7e6, 9e6);
        assert_eq!(bytes, 9e6);
        assert_eq!(source, CostSource::Predicted);

        // Hybrid: 30 % prediction + 70 % observation.
        let (bytes, source) = effective(LoadBalancingMode::Hybrid, 7e6, 9e6);
        assert!((bytes - (0.3 * 9e6 + 0.7 * 7e6)).abs() < 1.0);
        assert_eq!(source, CostSource::Hybrid);
    }
}
