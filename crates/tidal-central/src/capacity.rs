//! Capacity controller — the tier ladder state machine.
//!
//! Each backend walks `Off → Starting → On → Draining → Stopping →
//! Off`. The proactive rule maps the demand forecast onto a tier and
//! keeps exactly that tier's backend online; the reactive rule watches
//! sustained load windows and can elevate (overload) or depress (idle)
//! the proactive choice by one tier. A scale-up always reaches `On`
//! before the outgoing backend starts draining.
//!
//! The controller is a pure state machine: time, telemetry, and the
//! blacklist are injected, and power/alert side effects are returned
//! as actions for the owning loop to execute.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use tidal_common::alerts::AlertType;
use tidal_common::models::{Backend, BackendState, LiveSample, Tier};

// ── Tier ladder ─────────────────────────────────────────────────────

/// Maps a forecast (requests per hour) onto a tier. The axis is split
/// into three half-open intervals; a boundary value belongs to the
/// higher tier.
#[derive(Debug, Clone, Copy)]
pub struct TierLadder {
    pub upgrade_t2: f64,
    pub upgrade_t3: f64,
}

impl TierLadder {
    pub fn tier_for(&self, forecast: f64) -> Tier {
        if forecast < self.upgrade_t2 {
            Tier::T1
        } else if forecast < self.upgrade_t3 {
            Tier::T2
        } else {
            Tier::T3
        }
    }
}

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CapacitySettings {
    /// Wait after power-on before the backend may be declared `On`.
    pub stabilize: Duration,
    /// Drain budget before power-off.
    pub drain: Duration,
    /// Loop tick; used as coverage slack for the reactive windows.
    pub tick: Duration,
    pub overload_window: Duration,
    pub idle_window: Duration,
    pub overload_cpu: f64,
    pub overload_mem: f64,
    pub idle_cpu: f64,
    pub idle_mem: f64,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            stabilize: Duration::from_secs(80),
            drain: Duration::from_secs(30),
            tick: Duration::from_secs(10),
            overload_window: Duration::from_secs(300),
            idle_window: Duration::from_secs(1800),
            overload_cpu: 90.0,
            overload_mem: 90.0,
            idle_cpu: 3.0,
            idle_mem: 20.0,
        }
    }
}

// ── State machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerPhase {
    Off,
    Starting,
    On,
    Draining,
    Stopping,
}

impl std::fmt::Display for PowerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerPhase::Off => write!(f, "off"),
            PowerPhase::Starting => write!(f, "starting"),
            PowerPhase::On => write!(f, "on"),
            PowerPhase::Draining => write!(f, "draining"),
            PowerPhase::Stopping => write!(f, "stopping"),
        }
    }
}

/// Side effect requested by a tick, executed by the owning loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    PowerOn { id: String },
    PowerOff { id: String },
    HardReset { id: String },
    Alert {
        kind: AlertType,
        category: &'static str,
        title: String,
        message: String,
    },
}

/// Result of asking for a failed backend's replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplacementOutcome {
    /// The failed backend was redundant; it is simply unhealthy now.
    Redundant,
    /// A stand-in is being powered up.
    ReplacementStarted { replacement_id: String },
    /// No eligible backend exists (all off-pool candidates blacklisted).
    NoCandidate,
}

struct Runtime {
    phase: PowerPhase,
    phase_since: DateTime<Utc>,
    healthy: bool,
    /// Whether the current phase's power actuation was dispatched.
    dispatched: bool,
    /// Reactive-rule sliding window of `(time, cpu, mem)` samples.
    window: VecDeque<(DateTime<Utc>, f64, f64)>,
}

impl Runtime {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: PowerPhase::Off,
            phase_since: now,
            healthy: true,
            dispatched: false,
            window: VecDeque::new(),
        }
    }

    fn enter(&mut self, phase: PowerPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.phase_since = now;
        self.dispatched = false;
    }
}

pub struct CapacityController {
    backends: Vec<Backend>,
    runtime: HashMap<String, Runtime>,
    settings: CapacitySettings,
    ladder: TierLadder,
    active_tier: Tier,
    /// Sticky reactive elevation: cleared when the forecast catches up
    /// or an idle trigger fires.
    reactive_floor: Option<Tier>,
    /// Sticky reactive depression, symmetric to the floor.
    reactive_ceiling: Option<Tier>,
    /// `(failed, replacement)` pairs awaiting the replacement's `On`.
    pending_replacements: Vec<(String, String)>,
}

impl CapacityController {
    pub fn new(
        backends: Vec<Backend>,
        ladder: TierLadder,
        settings: CapacitySettings,
        now: DateTime<Utc>,
    ) -> Self {
        let runtime = backends
            .iter()
            .map(|b| (b.id.clone(), Runtime::new(now)))
            .collect();
        Self {
            backends,
            runtime,
            settings,
            ladder,
            active_tier: Tier::T1,
            reactive_floor: None,
            reactive_ceiling: None,
            pending_replacements: Vec::new(),
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn phase(&self, id: &str) -> Option<PowerPhase> {
        self.runtime.get(id).map(|r| r.phase)
    }

    pub fn active_tier(&self) -> Tier {
        self.active_tier
    }

    fn backend(&self, id: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Health flips never change power on their own.
    pub fn set_healthy(&mut self, id: &str, healthy: bool) {
        if let Some(rt) = self.runtime.get_mut(id) {
            rt.healthy = healthy;
        }
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.runtime.get(id).map(|r| r.healthy).unwrap_or(false)
    }

    /// Report the result of a dispatched power actuation.
    pub fn on_power_result(&mut self, id: &str, action: &Action, ok: bool) {
        let Some(rt) = self.runtime.get_mut(id) else {
            return;
        };
        match (action, rt.phase, ok) {
            (Action::PowerOn { .. }, PowerPhase::Starting, false) => {
                // Power-on failed; the proactive rule re-selects and
                // retries on a later tick.
                rt.enter(PowerPhase::Off, Utc::now());
            }
            (Action::PowerOff { .. }, PowerPhase::Stopping, true) => {
                rt.enter(PowerPhase::Off, Utc::now());
            }
            (Action::PowerOff { .. }, PowerPhase::Stopping, false) => {
                // Re-dispatch on the next tick.
                rt.dispatched = false;
            }
            _ => {}
        }
    }

    /// Mutable scheduling state per backend id, for the status document.
    pub fn states(&self) -> BTreeMap<String, BackendState> {
        self.backends
            .iter()
            .map(|b| {
                let rt = &self.runtime[&b.id];
                let active = matches!(rt.phase, PowerPhase::On | PowerPhase::Draining);
                (
                    b.id.clone(),
                    BackendState {
                        active,
                        draining: rt.phase == PowerPhase::Draining,
                        healthy: rt.healthy,
                    },
                )
            })
            .collect()
    }

    // ── Replacement ─────────────────────────────────────────────

    /// Called by the health checker once a backend exhausts its probe
    /// budget. Picks a same-tier (or next-tier-up) stand-in from the
    /// off pool, excluding blacklisted backends.
    pub fn plan_replacement(
        &mut self,
        failed_id: &str,
        blacklist: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> ReplacementOutcome {
        self.set_healthy(failed_id, false);
        let Some(failed) = self.backend(failed_id).cloned() else {
            return ReplacementOutcome::Redundant;
        };

        // Redundant if another schedulable backend of the same tier is
        // already online.
        let has_peer = self.backends.iter().any(|b| {
            b.id != failed_id
                && b.tier == failed.tier
                && !blacklist.contains(&b.id)
                && self.runtime[&b.id].phase == PowerPhase::On
                && self.runtime[&b.id].healthy
        });
        if has_peer || self.runtime[&failed.id].phase != PowerPhase::On {
            return ReplacementOutcome::Redundant;
        }

        // Walk the tier ladder upward for an off-pool candidate.
        let mut tier = Some(failed.tier);
        while let Some(t) = tier {
            let candidate = self.backends.iter().find(|b| {
                b.id != failed_id
                    && b.tier == t
                    && !blacklist.contains(&b.id)
                    && self.runtime[&b.id].phase == PowerPhase::Off
            });
            if let Some(candidate) = candidate {
                let id = candidate.id.clone();
                self.runtime.get_mut(&id).expect("runtime exists").enter(PowerPhase::Starting, now);
                self.pending_replacements.push((failed_id.to_string(), id.clone()));
                return ReplacementOutcome::ReplacementStarted { replacement_id: id };
            }
            tier = t.up();
        }
        ReplacementOutcome::NoCandidate
    }

    // ── Reactive windows ────────────────────────────────────────

    fn update_windows(&mut self, now: DateTime<Utc>, samples: &HashMap<String, LiveSample>) {
        let horizon =
            chrono::Duration::from_std(self.settings.idle_window).unwrap_or_else(|_| chrono::Duration::seconds(1800));
        for backend in &self.backends {
            let Some(rt) = self.runtime.get_mut(&backend.id) else {
                continue;
            };
            if let Some(sample) = samples.get(&backend.address) {
                // Stale telemetry never feeds the reactive rule.
                if sample.fresh {
                    rt.window.push_back((now, sample.cpu_pct, sample.memory_pct));
                }
            }
            while rt
                .window
                .front()
                .is_some_and(|(ts, _, _)| now.signed_duration_since(*ts) > horizon)
            {
                rt.window.pop_front();
            }
        }
    }

    /// True when every sample inside the trailing `window` satisfies
    /// `pred` and the samples actually span the window (oldest sample
    /// within one tick of the window start). Gaps or missing coverage
    /// mean insufficient data, not a trigger.
    fn sustained(
        window: &VecDeque<(DateTime<Utc>, f64, f64)>,
        now: DateTime<Utc>,
        span: Duration,
        tick: Duration,
        pred: impl Fn(f64, f64) -> bool,
    ) -> bool {
        let span = match chrono::Duration::from_std(span) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let slack = chrono::Duration::from_std(tick).unwrap_or_else(|_| chrono::Duration::seconds(10));
        let cutoff = now - span;
        let mut oldest: Option<DateTime<Utc>> = None;
        for (ts, cpu, mem) in window.iter() {
            if *ts < cutoff {
                continue;
            }
            if !pred(*cpu, *mem) {
                return false;
            }
            oldest = Some(oldest.map_or(*ts, |o| o.min(*ts)));
        }
        oldest.is_some_and(|o| o <= cutoff + slack)
    }

    fn clear_windows(&mut self) {
        for rt in self.runtime.values_mut() {
            rt.window.clear();
        }
    }

    /// Cluster-level reactive flags over the online backends.
    fn reactive_flags(&self, now: DateTime<Utc>, blacklist: &HashSet<String>) -> (bool, bool) {
        let online: Vec<&Runtime> = self
            .backends
            .iter()
            .filter(|b| !blacklist.contains(&b.id))
            .filter_map(|b| self.runtime.get(&b.id))
            .filter(|rt| rt.phase == PowerPhase::On)
            .collect();
        if online.is_empty() {
            return (false, false);
        }
        let s = &self.settings;
        let overloaded = online.iter().all(|rt| {
            Self::sustained(&rt.window, now, s.overload_window, s.tick, |cpu, mem| {
                cpu >= s.overload_cpu || mem >= s.overload_mem
            })
        });
        let idle = online.iter().all(|rt| {
            Self::sustained(&rt.window, now, s.idle_window, s.tick, |cpu, mem| {
                cpu <= s.idle_cpu && mem <= s.idle_mem
            })
        });
        (overloaded, idle)
    }

    // ── Tick ────────────────────────────────────────────────────

    /// One pass of the capacity loop. `forecast` is the current
    /// demand forecast (None while the forecaster has nothing).
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        forecast: Option<f64>,
        samples: &HashMap<String, LiveSample>,
        blacklist: &HashSet<String>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        self.update_windows(now, samples);

        // ── Advance in-flight phases ────────────────────────────
        let stabilize = chrono::Duration::from_std(self.settings.stabilize)
            .unwrap_or_else(|_| chrono::Duration::seconds(80));
        let drain = chrono::Duration::from_std(self.settings.drain)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for backend in &self.backends {
            let fresh = samples.get(&backend.address).is_some_and(|s| s.fresh);
            let Some(rt) = self.runtime.get_mut(&backend.id) else {
                continue;
            };
            match rt.phase {
                PowerPhase::Starting => {
                    if !rt.dispatched {
                        rt.dispatched = true;
                        actions.push(Action::PowerOn {
                            id: backend.id.clone(),
                        });
                    } else if now.signed_duration_since(rt.phase_since) >= stabilize && fresh {
                        rt.enter(PowerPhase::On, now);
                        rt.healthy = true;
                        actions.push(Action::Alert {
                            kind: AlertType::Success,
                            category: "capacity",
                            title: "Backend Online".to_string(),
                            message: format!("{} stabilised and reports fresh telemetry", backend.id),
                        });
                    }
                }
                PowerPhase::Draining => {
                    if now.signed_duration_since(rt.phase_since) >= drain {
                        rt.enter(PowerPhase::Stopping, now);
                        rt.dispatched = true;
                        actions.push(Action::PowerOff {
                            id: backend.id.clone(),
                        });
                    }
                }
                PowerPhase::Stopping => {
                    if !rt.dispatched {
                        rt.dispatched = true;
                        actions.push(Action::PowerOff {
                            id: backend.id.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        // ── Replacement continuation ────────────────────────────
        let mut still_pending = Vec::new();
        for (failed, replacement) in std::mem::take(&mut self.pending_replacements) {
            if self.runtime.get(&replacement).map(|r| r.phase) == Some(PowerPhase::On) {
                actions.push(Action::HardReset { id: failed.clone() });
                actions.push(Action::Alert {
                    kind: AlertType::Warning,
                    category: "health",
                    title: "Backend Replaced".to_string(),
                    message: format!("{replacement} took over from {failed}; hard reset issued"),
                });
            } else {
                still_pending.push((failed, replacement));
            }
        }
        self.pending_replacements = still_pending;

        // ── Target tier ─────────────────────────────────────────
        let proactive = forecast.map(|f| self.ladder.tier_for(f)).unwrap_or(self.active_tier);
        let (overloaded, idle) = self.reactive_flags(now, blacklist);

        if overloaded {
            let floor = self.active_tier.up().unwrap_or(Tier::T3);
            self.reactive_floor = Some(self.reactive_floor.map_or(floor, |f| f.max(floor)));
            self.reactive_ceiling = None;
            self.clear_windows();
            if floor > self.active_tier {
                actions.push(Action::Alert {
                    kind: AlertType::Warning,
                    category: "capacity",
                    title: "Reactive Scale-Up".to_string(),
                    message: format!(
                        "sustained load above {}% for {}s, elevating to {}",
                        self.settings.overload_cpu,
                        self.settings.overload_window.as_secs(),
                        floor
                    ),
                });
            }
        }
        if idle {
            let ceiling = self.active_tier.down().unwrap_or(Tier::T1);
            self.reactive_ceiling = Some(self.reactive_ceiling.map_or(ceiling, |c| c.min(ceiling)));
            self.reactive_floor = None;
            self.clear_windows();
            if ceiling < self.active_tier {
                actions.push(Action::Alert {
                    kind: AlertType::Info,
                    category: "capacity",
                    title: "Reactive Scale-Down".to_string(),
                    message: format!(
                        "cluster idle for {}s, depressing to {}",
                        self.settings.idle_window.as_secs(),
                        ceiling
                    ),
                });
            }
        }

        // The forecast catching up retires a sticky reactive bound.
        if self.reactive_floor.is_some_and(|f| proactive >= f) {
            self.reactive_floor = None;
        }
        if self.reactive_ceiling.is_some_and(|c| proactive <= c) {
            self.reactive_ceiling = None;
        }

        let mut target = proactive;
        if let Some(floor) = self.reactive_floor {
            target = target.max(floor);
        }
        if let Some(ceiling) = self.reactive_ceiling {
            target = target.min(ceiling);
        }

        // ── Converge on the target tier ─────────────────────────
        let desired = self.select_for_tier(target, blacklist);
        let Some(desired_id) = desired else {
            actions.push(Action::Alert {
                kind: AlertType::Critical,
                category: "capacity",
                title: "No Eligible Backend".to_string(),
                message: format!("no non-blacklisted backend available for {target}"),
            });
            return actions;
        };

        let desired_phase = self.runtime[&desired_id].phase;
        match desired_phase {
            PowerPhase::Off => {
                let rt = self.runtime.get_mut(&desired_id).expect("runtime exists");
                rt.enter(PowerPhase::Starting, now);
                rt.dispatched = true;
                actions.push(Action::PowerOn {
                    id: desired_id.clone(),
                });
                actions.push(Action::Alert {
                    kind: AlertType::Info,
                    category: "capacity",
                    title: "Scale Initiated".to_string(),
                    message: format!("powering up {desired_id} for {target}"),
                });
            }
            PowerPhase::On => {
                self.active_tier = target;
                // The incoming backend is serving; out-of-tier
                // backends may now leave. Blacklisted backends stay
                // up so recovery probes can reach them.
                for backend in &self.backends {
                    if backend.id == desired_id || blacklist.contains(&backend.id) {
                        continue;
                    }
                    let Some(rt) = self.runtime.get_mut(&backend.id) else {
                        continue;
                    };
                    match rt.phase {
                        PowerPhase::On => {
                            rt.enter(PowerPhase::Draining, now);
                            actions.push(Action::Alert {
                                kind: AlertType::Info,
                                category: "capacity",
                                title: "Backend Draining".to_string(),
                                message: format!(
                                    "{} leaving service, {}s drain budget",
                                    backend.id,
                                    self.settings.drain.as_secs()
                                ),
                            });
                        }
                        PowerPhase::Starting => {
                            // A superseded scale-up; never served, so
                            // skip the drain.
                            rt.enter(PowerPhase::Stopping, now);
                        }
                        _ => {}
                    }
                }
            }
            // Starting / Draining / Stopping: let it run its course.
            _ => {}
        }

        actions
    }

    /// The unique backend that should serve `tier`, preferring one
    /// already on (or coming up) and skipping the blacklist. If the
    /// tier's pool is exhausted the search walks up the ladder — a
    /// larger machine can absorb the band, a smaller one cannot.
    fn select_for_tier(&self, tier: Tier, blacklist: &HashSet<String>) -> Option<String> {
        let mut search = Some(tier);
        while let Some(t) = search {
            let eligible: Vec<&Backend> = self
                .backends
                .iter()
                .filter(|b| b.tier == t && !blacklist.contains(&b.id))
                .collect();
            let by_phase = |phase: PowerPhase| {
                eligible
                    .iter()
                    .find(|b| self.runtime[&b.id].phase == phase && self.runtime[&b.id].healthy)
            };
            let found = by_phase(PowerPhase::On)
                .or_else(|| by_phase(PowerPhase::Starting))
                .or_else(|| by_phase(PowerPhase::Off))
                .map(|b| b.id.clone());
            if found.is_some() {
                return found;
            }
            search = t.up();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend(id: &str, tier: Tier) -> Backend {
        Backend {
            id: id.to_string(),
            address: format!("addr-{id}"),
            vm_name: format!("vm-{id}"),
            tier,
            capacity_cores: 4,
            capacity_memory_bytes: 8 << 30,
        }
    }

    fn sample(cpu: f64, mem: f64) -> LiveSample {
        LiveSample {
            cpu_pct: cpu,
            memory_pct: mem,
            rps: 100.0,
            total_memory_bytes: 8 << 30,
            total_cpu_cores: 4,
            fresh: true,
        }
    }

    fn ladder() -> TierLadder {
        TierLadder {
            upgrade_t2: 100_000.0,
            upgrade_t3: 250_000.0,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap()
    }

    /// Fresh samples for every backend of the controller.
    fn all_samples(ctrl: &CapacityController, cpu: f64, mem: f64) -> HashMap<String, LiveSample> {
        ctrl.backends()
            .iter()
            .map(|b| (b.address.clone(), sample(cpu, mem)))
            .collect()
    }

    fn controller(backends: Vec<Backend>) -> CapacityController {
        CapacityController::new(backends, ladder(), CapacitySettings::default(), t0())
    }

    fn power_ons(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::PowerOn { id } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn has_alert(actions: &[Action], wanted: &str) -> bool {
        actions.iter().any(|a| matches!(a, Action::Alert { title, .. } if title == wanted))
    }

    #[test]
    fn ladder_is_monotone_with_boundaries_in_upper_tier() {
        let l = ladder();
        assert_eq!(l.tier_for(0.0), Tier::T1);
        assert_eq!(l.tier_for(99_999.9), Tier::T1);
        // Boundary value belongs to the interval it opens.
        assert_eq!(l.tier_for(100_000.0), Tier::T2);
        assert_eq!(l.tier_for(249_999.9), Tier::T2);
        assert_eq!(l.tier_for(250_000.0), Tier::T3);
        assert_eq!(l.tier_for(1e9), Tier::T3);

        // Monotone non-decreasing along the axis.
        let mut prev = Tier::T1;
        for v in (0..400_000).step_by(1000) {
            let t = l.tier_for(v as f64);
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn cold_start_brings_up_only_the_forecast_tier() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();

        let actions = ctrl.tick(t0(), Some(50_000.0), &HashMap::new(), &blacklist);
        assert_eq!(power_ons(&actions), vec!["web-t1".to_string()]);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Starting));
        assert_eq!(ctrl.phase("web-t2"), Some(PowerPhase::Off));

        // Not yet stabilised: 60 s in, even with a fresh sample.
        let now = t0() + chrono::Duration::seconds(60);
        ctrl.tick(now, Some(50_000.0), &all_samples(&ctrl, 10.0, 10.0), &blacklist);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Starting));

        // Stabilised but no fresh sample yet: still starting.
        let now = t0() + chrono::Duration::seconds(90);
        ctrl.tick(now, Some(50_000.0), &HashMap::new(), &blacklist);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Starting));

        // Stabilised and fresh: online.
        let actions = ctrl.tick(
            now + chrono::Duration::seconds(10),
            Some(50_000.0),
            &all_samples(&ctrl, 10.0, 10.0),
            &blacklist,
        );
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::On));
        assert_eq!(ctrl.phase("web-t2"), Some(PowerPhase::Off));
        assert!(has_alert(&actions, "Backend Online"));
    }

    /// Walks a controller to "tier backend online" state.
    fn bring_online(ctrl: &mut CapacityController, forecast: f64) -> DateTime<Utc> {
        let blacklist = HashSet::new();
        let mut now = t0();
        for _ in 0..12 {
            now += chrono::Duration::seconds(10);
            ctrl.tick(now, Some(forecast), &all_samples(ctrl, 10.0, 30.0), &blacklist);
        }
        now
    }

    #[test]
    fn proactive_upgrade_reaches_on_before_draining_the_outgoing() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 50_000.0);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::On));

        // Forecast jumps into the tier-2 interval.
        now += chrono::Duration::seconds(10);
        let actions = ctrl.tick(now, Some(300_000.0), &all_samples(&ctrl, 50.0, 50.0), &blacklist);
        assert_eq!(power_ons(&actions), vec!["web-t2".to_string()]);

        // While tier-2 stabilises, tier-1 keeps serving; the drain
        // begins only in the tick where tier-2 reaches On.
        let mut switch_actions = Vec::new();
        for _ in 0..10 {
            now += chrono::Duration::seconds(10);
            let actions =
                ctrl.tick(now, Some(300_000.0), &all_samples(&ctrl, 50.0, 50.0), &blacklist);
            if ctrl.phase("web-t2") == Some(PowerPhase::On) {
                switch_actions = actions;
                break;
            }
            assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::On));
        }
        assert_eq!(ctrl.phase("web-t2"), Some(PowerPhase::On));

        // Tier-1 drains strictly after tier-2 came on; the document
        // must show draining=true while still active.
        assert!(has_alert(&switch_actions, "Backend Draining"));
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Draining));
        let state = &ctrl.states()["web-t1"];
        assert!(state.active && state.draining);

        // After the 30 s drain budget: stopping, then off.
        now += chrono::Duration::seconds(30);
        let actions = ctrl.tick(now, Some(300_000.0), &all_samples(&ctrl, 50.0, 50.0), &blacklist);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Stopping));
        let off = actions
            .iter()
            .find(|a| matches!(a, Action::PowerOff { id } if id == "web-t1"))
            .cloned()
            .unwrap();
        ctrl.on_power_result("web-t1", &off, true);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Off));
        assert_eq!(ctrl.active_tier(), Tier::T2);
    }

    #[test]
    fn reactive_overload_elevates_one_tier_once() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 50_000.0);

        // Five minutes of cpu >= 90 on the online backend.
        let mut scale_up_seen = false;
        let mut power_on_count = 0;
        for _ in 0..31 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(50_000.0), &all_samples(&ctrl, 95.0, 40.0), &blacklist);
            power_on_count += power_ons(&actions).len();
            if has_alert(&actions, "Reactive Scale-Up") {
                scale_up_seen = true;
            }
        }
        assert!(scale_up_seen, "sustained overload must trigger a reactive scale-up");
        assert_eq!(ctrl.phase("web-t2"), Some(PowerPhase::Starting));
        assert_eq!(power_on_count, 1);

        // No second scale-up during the stabilisation window even
        // though load stays high.
        for _ in 0..6 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(50_000.0), &all_samples(&ctrl, 95.0, 40.0), &blacklist);
            assert!(power_ons(&actions).is_empty());
            assert!(!has_alert(&actions, "Reactive Scale-Up"));
        }
    }

    #[test]
    fn overload_needs_full_window_coverage() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 50_000.0);

        // Two minutes of overload is not five.
        for _ in 0..12 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(50_000.0), &all_samples(&ctrl, 95.0, 95.0), &blacklist);
            assert!(!has_alert(&actions, "Reactive Scale-Up"));
        }
        assert_eq!(ctrl.phase("web-t2"), Some(PowerPhase::Off));
    }

    #[test]
    fn stale_samples_never_feed_the_reactive_rule() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 50_000.0);

        let stale: HashMap<String, LiveSample> = ctrl
            .backends()
            .iter()
            .map(|b| (b.address.clone(), LiveSample::stale()))
            .collect();
        for _ in 0..40 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(50_000.0), &stale, &blacklist);
            assert!(!has_alert(&actions, "Reactive Scale-Up"));
            assert!(!has_alert(&actions, "Reactive Scale-Down"));
        }
    }

    #[test]
    fn reactive_idle_depresses_below_the_proactive_tier() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        // Forecast keeps tier 2 online.
        let mut now = bring_online(&mut ctrl, 150_000.0);
        assert_eq!(ctrl.phase("web-t2"), Some(PowerPhase::On));

        // Thirty minutes of idle readings.
        let mut scale_down_seen = false;
        for _ in 0..182 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(150_000.0), &all_samples(&ctrl, 2.0, 10.0), &blacklist);
            if has_alert(&actions, "Reactive Scale-Down") {
                scale_down_seen = true;
            }
        }
        assert!(scale_down_seen);
        assert_ne!(ctrl.phase("web-t1"), Some(PowerPhase::Off));
    }

    #[test]
    fn overload_at_the_top_tier_is_a_noop() {
        let mut ctrl = controller(vec![backend("web-t3", Tier::T3)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 900_000.0);
        assert_eq!(ctrl.active_tier(), Tier::T3);

        for _ in 0..40 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(900_000.0), &all_samples(&ctrl, 99.0, 99.0), &blacklist);
            assert!(!has_alert(&actions, "Reactive Scale-Up"));
        }
    }

    #[test]
    fn power_on_failure_reverts_to_off_and_retries() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1)]);
        let blacklist = HashSet::new();

        let actions = ctrl.tick(t0(), Some(10_000.0), &HashMap::new(), &blacklist);
        let on = actions
            .iter()
            .find(|a| matches!(a, Action::PowerOn { .. }))
            .cloned()
            .unwrap();
        ctrl.on_power_result("web-t1", &on, false);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::Off));

        // The next tick re-selects and re-dispatches.
        let actions = ctrl.tick(
            t0() + chrono::Duration::seconds(10),
            Some(10_000.0),
            &HashMap::new(),
            &blacklist,
        );
        assert_eq!(power_ons(&actions), vec!["web-t1".to_string()]);
    }

    #[test]
    fn replacement_prefers_same_tier_then_walks_up() {
        let mut ctrl = controller(vec![
            backend("web-t2a", Tier::T2),
            backend("web-t2b", Tier::T2),
            backend("web-t3", Tier::T3),
        ]);
        let blacklist = HashSet::new();
        let now = bring_online(&mut ctrl, 150_000.0);
        let failed = if ctrl.phase("web-t2a") == Some(PowerPhase::On) {
            "web-t2a"
        } else {
            "web-t2b"
        };
        let spare = if failed == "web-t2a" { "web-t2b" } else { "web-t2a" };

        let outcome = ctrl.plan_replacement(failed, &blacklist, now);
        assert_eq!(
            outcome,
            ReplacementOutcome::ReplacementStarted {
                replacement_id: spare.to_string()
            }
        );
        assert_eq!(ctrl.phase(spare), Some(PowerPhase::Starting));
        assert!(!ctrl.is_healthy(failed));

        // Same-tier spare blacklisted: the search walks up to tier 3.
        let mut ctrl = controller(vec![
            backend("web-t2a", Tier::T2),
            backend("web-t2b", Tier::T2),
            backend("web-t3", Tier::T3),
        ]);
        let now = bring_online(&mut ctrl, 150_000.0);
        let failed = if ctrl.phase("web-t2a") == Some(PowerPhase::On) {
            "web-t2a"
        } else {
            "web-t2b"
        };
        let spare = if failed == "web-t2a" { "web-t2b" } else { "web-t2a" };
        let blacklist: HashSet<String> = [spare.to_string()].into_iter().collect();
        let outcome = ctrl.plan_replacement(failed, &blacklist, now);
        assert_eq!(
            outcome,
            ReplacementOutcome::ReplacementStarted {
                replacement_id: "web-t3".to_string()
            }
        );
    }

    #[test]
    fn replacement_with_everything_blacklisted_reports_no_candidate() {
        let mut ctrl = controller(vec![backend("web-t2a", Tier::T2), backend("web-t2b", Tier::T2)]);
        let now = bring_online(&mut ctrl, 150_000.0);
        let failed = if ctrl.phase("web-t2a") == Some(PowerPhase::On) {
            "web-t2a"
        } else {
            "web-t2b"
        };
        let blacklist: HashSet<String> =
            ["web-t2a".to_string(), "web-t2b".to_string()].into_iter().collect();
        assert_eq!(
            ctrl.plan_replacement(failed, &blacklist, now),
            ReplacementOutcome::NoCandidate
        );
    }

    #[test]
    fn replacement_reaching_on_triggers_the_hard_reset() {
        let mut ctrl = controller(vec![backend("web-t2a", Tier::T2), backend("web-t2b", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 150_000.0);
        let failed = if ctrl.phase("web-t2a") == Some(PowerPhase::On) {
            "web-t2a"
        } else {
            "web-t2b"
        };
        let spare = if failed == "web-t2a" { "web-t2b" } else { "web-t2a" };

        ctrl.plan_replacement(failed, &blacklist, now);
        // The failed backend is blacklisted from here on (the health
        // checker persists this); it must stay up for recovery probes.
        let blacklist: HashSet<String> = [failed.to_string()].into_iter().collect();

        let mut reset_seen = false;
        for _ in 0..12 {
            now += chrono::Duration::seconds(10);
            let actions = ctrl.tick(now, Some(150_000.0), &all_samples(&ctrl, 20.0, 20.0), &blacklist);
            if actions
                .iter()
                .any(|a| matches!(a, Action::HardReset { id } if id == failed))
            {
                reset_seen = true;
            }
        }
        assert!(reset_seen, "hard reset must follow the replacement's On");
        assert_eq!(ctrl.phase(spare), Some(PowerPhase::On));
        // Blacklisted backend is exempt from the drain sweep.
        assert_eq!(ctrl.phase(failed), Some(PowerPhase::On));
    }

    #[test]
    fn health_flip_alone_never_changes_power() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 50_000.0);

        ctrl.set_healthy("web-t1", false);
        now += chrono::Duration::seconds(10);
        ctrl.tick(now, Some(50_000.0), &all_samples(&ctrl, 20.0, 20.0), &blacklist);
        assert_eq!(ctrl.phase("web-t1"), Some(PowerPhase::On));
        let state = &ctrl.states()["web-t1"];
        assert!(state.active && !state.healthy);
    }

    #[test]
    fn states_uphold_draining_implies_active() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1), backend("web-t2", Tier::T2)]);
        let blacklist = HashSet::new();
        let mut now = bring_online(&mut ctrl, 50_000.0);

        // Drive through an upgrade so every phase is visited.
        for _ in 0..30 {
            now += chrono::Duration::seconds(10);
            ctrl.tick(now, Some(300_000.0), &all_samples(&ctrl, 50.0, 50.0), &blacklist);
            for state in ctrl.states().values() {
                assert!(!state.draining || state.active);
            }
        }
    }

    #[test]
    fn all_tier_backends_blacklisted_raises_critical() {
        let mut ctrl = controller(vec![backend("web-t1", Tier::T1)]);
        let blacklist: HashSet<String> = ["web-t1".to_string()].into_iter().collect();
        let actions = ctrl.tick(t0(), Some(10_000.0), &HashMap::new(), &blacklist);
        assert!(has_alert(&actions, "No Eligible Backend"));
        assert!(power_ons(&actions).is_empty());
    }
}
