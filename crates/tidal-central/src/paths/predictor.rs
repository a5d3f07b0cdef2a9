//! Per-path bandwidth prediction.
//!
//! One small model per directed path: an EWMA level channel, a trend
//! term, and a volatility channel (smoothed absolute deviation) that
//! caps how far a single spike can drag the forecast. Prediction is a
//! pure computation and always returns inside the tick; anything
//! non-finite falls back to the last observed value.
//!
//! Accuracy per model is tracked as a smoothed relative error and
//! exported through the stats endpoint.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tidal_common::ewma::Ewma;
use tidal_common::models::PathKey;

/// Windows of history retained per path (24 h of 1-minute windows).
const HISTORY_CAP: usize = 1440;

const LEVEL_ALPHA: f64 = 0.3;
const TREND_ALPHA: f64 = 0.2;
const VOLATILITY_ALPHA: f64 = 0.3;
const ACCURACY_ALPHA: f64 = 0.1;

pub struct PathModel {
    history: VecDeque<f64>,
    level: Ewma,
    trend: Ewma,
    volatility: Ewma,
    accuracy: Ewma,
    prev_level: Option<f64>,
    last_observed: f64,
    last_prediction: Option<f64>,
}

impl PathModel {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            level: Ewma::new(LEVEL_ALPHA),
            trend: Ewma::new(TREND_ALPHA),
            volatility: Ewma::new(VOLATILITY_ALPHA),
            accuracy: Ewma::new(ACCURACY_ALPHA),
            prev_level: None,
            last_observed: 0.0,
            last_prediction: None,
        }
    }

    /// Feed one observed window. Also settles the accuracy metric for
    /// the prediction that targeted this window.
    pub fn observe(&mut self, bytes: f64) {
        if let Some(predicted) = self.last_prediction.take() {
            let error = (predicted - bytes).abs() / bytes.max(1.0);
            self.accuracy.update(error);
        }

        self.history.push_back(bytes);
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }

        self.level.update(bytes);
        if let Some(prev) = self.prev_level {
            self.trend.update(self.level.value() - prev);
        }
        self.prev_level = Some(self.level.value());
        self.volatility.update((bytes - self.level.value()).abs());
        self.last_observed = bytes;
    }

    /// Predicted bytes for the next window, `>= 0`.
    pub fn predict(&mut self) -> f64 {
        if self.history.is_empty() {
            self.last_prediction = Some(0.0);
            return 0.0;
        }
        let raw = self.level.value() + self.trend.value();
        // A volatility band keeps one outlier window from swinging
        // the route weights.
        let ceiling = self.level.value() + 3.0 * self.volatility.value();
        let predicted = raw.clamp(0.0, ceiling.max(0.0));
        let predicted = if predicted.is_finite() {
            predicted
        } else {
            tracing::warn!("non-finite path prediction, falling back to last observation");
            self.last_observed
        };
        self.last_prediction = Some(predicted);
        predicted
    }

    pub fn windows(&self) -> usize {
        self.history.len()
    }

    pub fn last_observed(&self) -> f64 {
        self.last_observed
    }

    /// Smoothed relative error; `None` until a prediction has been
    /// scored.
    pub fn accuracy(&self) -> Option<f64> {
        self.accuracy.is_initialized().then(|| self.accuracy.value())
    }
}

/// The full set of per-path models.
pub struct PredictorBank {
    models: HashMap<PathKey, PathModel>,
    min_windows: usize,
}

impl PredictorBank {
    pub fn new(paths: Vec<PathKey>, min_windows: usize) -> Self {
        Self {
            models: paths.into_iter().map(|p| (p, PathModel::new())).collect(),
            min_windows,
        }
    }

    pub fn observe(&mut self, windows: &HashMap<PathKey, u64>) {
        for (path, bytes) in windows {
            if let Some(model) = self.models.get_mut(path) {
                model.observe(*bytes as f64);
            }
        }
    }

    /// Prediction mode needs a minimum of history on every path.
    pub fn ready(&self) -> bool {
        !self.models.is_empty() && self.models.values().all(|m| m.windows() >= self.min_windows)
    }

    pub fn predict(&mut self, path: &PathKey) -> f64 {
        self.models.get_mut(path).map(|m| m.predict()).unwrap_or(0.0)
    }

    pub fn last_observed(&self, path: &PathKey) -> f64 {
        self.models.get(path).map(|m| m.last_observed()).unwrap_or(0.0)
    }

    /// Exported accuracy metrics keyed by path name.
    pub fn accuracies(&self) -> BTreeMap<String, f64> {
        self.models
            .iter()
            .filter_map(|(path, m)| m.accuracy().map(|a| (path.to_string(), a)))
            .collect()
    }

    /// Persisted form of the sliding history, keyed by path name.
    pub fn history_snapshot(&self) -> BTreeMap<String, Vec<f64>> {
        self.models
            .iter()
            .map(|(path, m)| (path.to_string(), m.history.iter().copied().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Vec<PathKey> {
        vec![
            PathKey::new("leaf1", "spine0", "leaf6"),
            PathKey::new("leaf1", "spine1", "leaf6"),
        ]
    }

    #[test]
    fn prediction_is_never_negative() {
        let mut model = PathModel::new();
        for bytes in [5_000_000.0, 3_000_000.0, 100.0, 0.0, 0.0, 0.0] {
            model.observe(bytes);
        }
        assert!(model.predict() >= 0.0);
    }

    #[test]
    fn steady_traffic_predicts_near_the_level() {
        let mut model = PathModel::new();
        for _ in 0..50 {
            model.observe(2_000_000.0);
        }
        let predicted = model.predict();
        assert!((predicted - 2_000_000.0).abs() < 50_000.0, "predicted {predicted}");
    }

    #[test]
    fn rising_traffic_predicts_above_the_level() {
        let mut flat = PathModel::new();
        let mut rising = PathModel::new();
        for i in 0..50 {
            flat.observe(5_000_000.0);
            rising.observe(1_000_000.0 + 200_000.0 * i as f64);
        }
        assert!(rising.predict() > rising.level.value());
        let flat_predicted = flat.predict();
        assert!((flat_predicted - 5_000_000.0).abs() < 100_000.0);
    }

    #[test]
    fn empty_model_predicts_zero() {
        let mut model = PathModel::new();
        assert_eq!(model.predict(), 0.0);
    }

    #[test]
    fn accuracy_settles_after_observations() {
        let mut model = PathModel::new();
        model.observe(1_000_000.0);
        assert!(model.accuracy().is_none());

        // Predict, then observe the same value: perfect prediction.
        for _ in 0..20 {
            model.predict();
            model.observe(1_000_000.0);
        }
        let acc = model.accuracy().unwrap();
        assert!(acc < 0.05, "relative error {acc}");
    }

    #[test]
    fn bank_reports_ready_only_with_full_history() {
        let mut bank = PredictorBank::new(paths(), 10);
        assert!(!bank.ready());

        let windows: HashMap<PathKey, u64> =
            paths().into_iter().map(|p| (p, 1_000_000)).collect();
        for _ in 0..9 {
            bank.observe(&windows);
        }
        assert!(!bank.ready());
        bank.observe(&windows);
        assert!(bank.ready());
    }

    #[test]
    fn bank_tracks_paths_independently() {
        let mut bank = PredictorBank::new(paths(), 10);
        let mut windows = HashMap::new();
        windows.insert(PathKey::new("leaf1", "spine0", "leaf6"), 4_000_000u64);
        windows.insert(PathKey::new("leaf1", "spine1", "leaf6"), 1_000_000u64);
        for _ in 0..20 {
            bank.observe(&windows);
        }
        let p0 = bank.predict(&PathKey::new("leaf1", "spine0", "leaf6"));
        let p1 = bank.predict(&PathKey::new("leaf1", "spine1", "leaf6"));
        assert!(p0 > 3_000_000.0);
        assert!(p1 < 2_000_000.0);
    }
}
