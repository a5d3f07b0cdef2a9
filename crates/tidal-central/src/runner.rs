//! Capacity loop wiring.
//!
//! Drives the state machine every tick: integrate power and probe
//! results that arrived since the last pass, refresh telemetry and
//! the forecast, execute the controller's actions, and keep the
//! status document synced to the edge. Power actuations and health
//! probes run as short-lived tasks reporting through channels, so a
//! slow hypervisor never stalls the tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use tidal_common::alerts::AlertJournal;
use tidal_common::backoff;
use tidal_common::models::LiveSample;
use tidal_common::telemetry::MetricsClient;

use crate::capacity::{Action, CapacityController, PowerPhase, ReplacementOutcome};
use crate::forecast::{Forecaster, TrafficHistorySource};
use crate::health::{HealthChecker, HealthEvent};
use crate::power::{PowerAction, PowerActuator};
use crate::status::{self, ShipOutcome, StatusSyncer};

/// Result of one dispatched power actuation.
struct PowerOutcome {
    id: String,
    action: Action,
    ok: bool,
    error: Option<String>,
}

pub struct CapacityLoop {
    tick: Duration,
    sample_max_age: Duration,
    metrics: MetricsClient,
    traffic: Box<dyn TrafficHistorySource>,
    actuator: Arc<dyn PowerActuator>,
    forecaster: Forecaster,
    controller: CapacityController,
    health: HealthChecker,
    syncer: StatusSyncer,
    journal: Arc<AlertJournal>,

    power_tx: mpsc::UnboundedSender<PowerOutcome>,
    power_rx: mpsc::UnboundedReceiver<PowerOutcome>,
    probe_tx: mpsc::UnboundedSender<Vec<(String, bool)>>,
    probe_rx: mpsc::UnboundedReceiver<Vec<(String, bool)>>,
    probe_inflight: bool,
    actuations: JoinSet<()>,
}

impl CapacityLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tick: Duration,
        sample_max_age: Duration,
        metrics: MetricsClient,
        traffic: Box<dyn TrafficHistorySource>,
        actuator: Arc<dyn PowerActuator>,
        forecaster: Forecaster,
        controller: CapacityController,
        health: HealthChecker,
        syncer: StatusSyncer,
        journal: Arc<AlertJournal>,
    ) -> Self {
        let (power_tx, power_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        Self {
            tick,
            sample_max_age,
            metrics,
            traffic,
            actuator,
            forecaster,
            controller,
            health,
            syncer,
            journal,
            power_tx,
            power_rx,
            probe_tx,
            probe_rx,
            probe_inflight: false,
            actuations: JoinSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // In-flight power actuations may finish, bounded by a join
        // deadline; periodic work stops immediately.
        tracing::info!("capacity loop stopping, joining in-flight actuations");
        let _ = tokio::time::timeout(Duration::from_secs(30), async {
            while self.actuations.join_next().await.is_some() {}
        })
        .await;
    }

    async fn pass(&mut self) {
        let now = Utc::now();
        self.integrate_power_results();
        self.integrate_probe_results(now);

        // ── Telemetry ───────────────────────────────────────────
        let addresses: Vec<String> = self
            .controller
            .backends()
            .iter()
            .map(|b| b.address.clone())
            .collect();
        let address_refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
        let samples = match self
            .metrics
            .live_samples(&address_refs, self.sample_max_age)
            .await
        {
            Ok(samples) => samples,
            Err(e) => {
                self.journal.warning(
                    "telemetry",
                    "Metrics DB Unavailable",
                    &format!("treating all samples as stale: {e}"),
                );
                addresses
                    .iter()
                    .map(|a| (a.clone(), LiveSample::stale()))
                    .collect()
            }
        };

        // ── Forecast ────────────────────────────────────────────
        let forecast = self
            .forecaster
            .current(now, &*self.traffic, &self.journal)
            .await
            .map(|f| f.value);

        // ── State machine ───────────────────────────────────────
        let actions = self
            .controller
            .tick(now, forecast, &samples, self.health.blacklist());
        for action in actions {
            self.execute(action);
        }

        // ── Health probes ───────────────────────────────────────
        self.launch_probes();

        // ── Status document ─────────────────────────────────────
        let doc = status::build_document(self.controller.backends(), &self.controller.states());
        match self.syncer.sync(&doc).await {
            Ok(ShipOutcome::ShipFailed(e)) => {
                self.journal.warning(
                    "sync",
                    "Status Sync Failed",
                    &format!("central state remains authoritative: {e}"),
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.journal.critical(
                    "sync",
                    "Status Write Failed",
                    &format!("could not persist status document: {e}"),
                );
            }
        }
    }

    fn integrate_power_results(&mut self) {
        while let Ok(outcome) = self.power_rx.try_recv() {
            self.controller
                .on_power_result(&outcome.id, &outcome.action, outcome.ok);
            if !outcome.ok {
                let error = outcome.error.unwrap_or_default();
                let title = match outcome.action {
                    Action::PowerOn { .. } => "Power-On Failed",
                    Action::PowerOff { .. } => "Power-Off Failed",
                    Action::HardReset { .. } => "Hard Reset Failed",
                    Action::Alert { .. } => continue,
                };
                self.journal.critical(
                    "power",
                    title,
                    &format!("{}: {error}", outcome.id),
                );
            }
        }
    }

    fn integrate_probe_results(&mut self, now: chrono::DateTime<Utc>) {
        while let Ok(results) = self.probe_rx.try_recv() {
            self.probe_inflight = false;
            for (id, ok) in results {
                match self.health.record(&id, ok) {
                    HealthEvent::BecameUnhealthy => self.handle_unhealthy(&id, now),
                    HealthEvent::Recovered => {
                        self.controller.set_healthy(&id, true);
                        self.journal.success(
                            "health",
                            "Backend Recovered",
                            &format!("{id} cleared the blacklist after consecutive probe successes"),
                        );
                    }
                    HealthEvent::NoChange => {
                        // A redundant backend that went unhealthy earns
                        // its way back with a plain probe success.
                        if ok
                            && !self.health.is_blacklisted(&id)
                            && !self.controller.is_healthy(&id)
                        {
                            self.controller.set_healthy(&id, true);
                            self.journal.success(
                                "health",
                                "Backend Healthy",
                                &format!("{id} responded to probes again"),
                            );
                        }
                    }
                }
            }
        }
    }

    fn handle_unhealthy(&mut self, id: &str, now: chrono::DateTime<Utc>) {
        self.journal.critical(
            "health",
            "Backend Unhealthy",
            &format!("{id} failed {} consecutive probes", crate::health::FAILURE_THRESHOLD),
        );
        let outcome = self
            .controller
            .plan_replacement(id, self.health.blacklist(), now);
        match outcome {
            ReplacementOutcome::ReplacementStarted { replacement_id } => {
                self.health.add_to_blacklist(id);
                self.journal.warning(
                    "health",
                    "Backend Blacklisted",
                    &format!("{id} blacklisted; {replacement_id} starting as its replacement"),
                );
            }
            ReplacementOutcome::Redundant => {
                self.journal.warning(
                    "health",
                    "Backend Excluded",
                    &format!("{id} is redundant; the edge will stop selecting it"),
                );
            }
            ReplacementOutcome::NoCandidate => {
                self.journal.critical(
                    "health",
                    "Replacement Unavailable",
                    &format!(
                        "{id} has no eligible replacement (remaining pool blacklisted); \
                         the edge retains its last-known target"
                    ),
                );
            }
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Alert {
                kind,
                category,
                title,
                message,
            } => {
                self.journal.push(kind, category, &title, &message);
            }
            Action::PowerOn { id } => self.dispatch_power(id, PowerAction::On),
            Action::PowerOff { id } => self.dispatch_power(id, PowerAction::Off),
            Action::HardReset { id } => self.dispatch_power(id, PowerAction::HardReset),
        }
    }

    fn dispatch_power(&mut self, id: String, power: PowerAction) {
        let Some(backend) = self
            .controller
            .backends()
            .iter()
            .find(|b| b.id == id)
            .cloned()
        else {
            return;
        };
        let action = match power {
            PowerAction::On => Action::PowerOn { id: id.clone() },
            PowerAction::Off => Action::PowerOff { id: id.clone() },
            PowerAction::HardReset => Action::HardReset { id: id.clone() },
        };
        let actuator = self.actuator.clone();
        let tx = self.power_tx.clone();
        self.actuations.spawn(async move {
            let result = backoff::retry(backoff::DEFAULT_ATTEMPTS, Duration::from_secs(1), || {
                actuator.set_power(&backend.vm_name, power)
            })
            .await;
            let outcome = PowerOutcome {
                id,
                action,
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            };
            let _ = tx.send(outcome);
        });
    }

    fn launch_probes(&mut self) {
        if self.probe_inflight {
            return;
        }
        let targets: Vec<(String, String)> = self
            .controller
            .backends()
            .iter()
            .filter(|b| self.controller.phase(&b.id) == Some(PowerPhase::On))
            .map(|b| (b.id.clone(), b.address.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }
        self.probe_inflight = true;
        let prober = self.health.prober();
        let tx = self.probe_tx.clone();
        tokio::spawn(async move {
            let results = prober.probe_all(targets).await;
            let _ = tx.send(results);
        });
    }
}
