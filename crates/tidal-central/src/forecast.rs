//! Demand forecasting for the capacity loop.
//!
//! At most one forecast per natural clock hour: the cached value is
//! returned verbatim until its hour boundary passes, then the last 24
//! hours of request counts are fetched and run through the sequence
//! model. A failed evaluation reuses the previous cache; two
//! consecutive failures schedule an asynchronous retrain that swaps
//! the model reference atomically and never blocks the loop.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};

use tidal_common::alerts::AlertJournal;
use tidal_common::docstore;
use tidal_common::ewma::Ewma;
use tidal_common::models::Forecast;

pub const HISTORY_HOURS: u32 = 24;

/// Black-box sequence predictor. `retrain` builds a replacement model
/// from history; the caller swaps the reference atomically.
pub trait SequenceModel: Send + Sync {
    fn predict(&self, history: &[f64]) -> anyhow::Result<f64>;
    fn retrain(&self, history: &[f64]) -> anyhow::Result<Box<dyn SequenceModel>>;
}

// ── Shipped model ───────────────────────────────────────────────────

/// Double-exponential (level + trend) smoother. Runs the history
/// through EWMA level and trend channels and extrapolates one step.
pub struct HoltModel {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for HoltModel {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.2,
        }
    }
}

impl HoltModel {
    /// One-step-ahead forecast over `history`, oldest first.
    fn forecast(alpha: f64, beta: f64, history: &[f64]) -> Option<f64> {
        if history.len() < 2 {
            return None;
        }
        let mut level = Ewma::new(alpha);
        let mut trend = Ewma::new(beta);
        let mut prev_level = history[0];
        level.update(history[0]);
        for value in &history[1..] {
            level.update(*value);
            trend.update(level.value() - prev_level);
            prev_level = level.value();
        }
        Some((level.value() + trend.value()).max(0.0))
    }

    /// Sum of squared one-step errors over the history, for fitting.
    fn fit_error(alpha: f64, beta: f64, history: &[f64]) -> f64 {
        let mut error = 0.0;
        for split in 2..history.len() {
            if let Some(predicted) = Self::forecast(alpha, beta, &history[..split]) {
                let actual = history[split];
                error += (predicted - actual).powi(2);
            }
        }
        error
    }
}

impl SequenceModel for HoltModel {
    fn predict(&self, history: &[f64]) -> anyhow::Result<f64> {
        Self::forecast(self.alpha, self.beta, history)
            .ok_or_else(|| anyhow::anyhow!("insufficient history: {} points", history.len()))
    }

    fn retrain(&self, history: &[f64]) -> anyhow::Result<Box<dyn SequenceModel>> {
        if history.len() < 4 {
            anyhow::bail!("insufficient history to retrain: {} points", history.len());
        }
        let mut best = (self.alpha, self.beta);
        let mut best_error = f64::MAX;
        for alpha in [0.2, 0.4, 0.6, 0.8] {
            for beta in [0.1, 0.2, 0.3] {
                let error = Self::fit_error(alpha, beta, history);
                if error < best_error {
                    best_error = error;
                    best = (alpha, beta);
                }
            }
        }
        Ok(Box::new(HoltModel {
            alpha: best.0,
            beta: best.1,
        }))
    }
}

// ── Traffic history source ──────────────────────────────────────────

#[async_trait]
pub trait TrafficHistorySource: Send + Sync {
    /// Hourly request counts, oldest first.
    async fn hourly_counts(&self, hours: u32) -> anyhow::Result<Vec<f64>>;
}

/// HTTP client for the request-count database.
pub struct TrafficDb {
    http: reqwest::Client,
    base_url: String,
}

impl TrafficDb {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TrafficHistorySource for TrafficDb {
    async fn hourly_counts(&self, hours: u32) -> anyhow::Result<Vec<f64>> {
        #[derive(serde::Deserialize)]
        struct Response {
            counts: Vec<f64>,
        }
        let url = format!("{}/api/requests/hourly", self.base_url);
        let resp: Response = self
            .http
            .get(&url)
            .query(&[("hours", hours)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.counts)
    }
}

// ── Forecaster ──────────────────────────────────────────────────────

/// The first instant of the next natural clock hour.
pub fn next_hour_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + chrono::Duration::hours(1)
}

pub struct Forecaster {
    model: Arc<ArcSwap<Box<dyn SequenceModel>>>,
    cache: Option<Forecast>,
    consecutive_failures: u32,
    history_path: PathBuf,
    cache_path: PathBuf,
}

impl Forecaster {
    /// Rehydrates the persisted forecast cache so a restart inside an
    /// hour does not produce a second forecast for it.
    pub fn new(model: Box<dyn SequenceModel>, history_path: PathBuf, cache_path: PathBuf) -> Self {
        let cache: Option<Forecast> = docstore::read_json(&cache_path).ok();
        Self {
            model: Arc::new(ArcSwap::new(Arc::new(model))),
            cache,
            consecutive_failures: 0,
            history_path,
            cache_path,
        }
    }

    pub fn cached(&self) -> Option<Forecast> {
        self.cache
    }

    /// The forecast for this tick. Serves the cache while valid;
    /// otherwise fetches history and evaluates the model. On failure
    /// the previous cached value is reused verbatim.
    pub async fn current(
        &mut self,
        now: DateTime<Utc>,
        source: &dyn TrafficHistorySource,
        journal: &AlertJournal,
    ) -> Option<Forecast> {
        if let Some(cached) = self.cache {
            if cached.is_valid_at(now) {
                return Some(cached);
            }
        }

        match self.refresh(now, source).await {
            Ok(forecast) => {
                self.consecutive_failures = 0;
                self.cache = Some(forecast);
                if let Err(e) = docstore::write_json_atomic(&self.cache_path, &forecast) {
                    tracing::warn!(error = %e, "failed to persist forecast cache");
                }
                Some(forecast)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                journal.warning(
                    "forecast",
                    "Forecast Evaluation Failed",
                    &format!("reusing previous value: {e}"),
                );
                if self.consecutive_failures == 2 {
                    journal.critical(
                        "forecast",
                        "Forecast Retraining Scheduled",
                        "two consecutive evaluation failures",
                    );
                    self.schedule_retrain();
                }
                self.cache
            }
        }
    }

    async fn refresh(
        &self,
        now: DateTime<Utc>,
        source: &dyn TrafficHistorySource,
    ) -> anyhow::Result<Forecast> {
        let history = source.hourly_counts(HISTORY_HOURS).await?;
        if let Err(e) = docstore::write_json_atomic(&self.history_path, &history) {
            tracing::warn!(error = %e, "failed to persist traffic history");
        }
        let value = self.model.load().predict(&history)?;
        Ok(Forecast {
            value,
            valid_until: next_hour_boundary(now),
        })
    }

    /// Retraining runs off-loop; completion swaps the model reference
    /// atomically.
    fn schedule_retrain(&self) {
        let model = self.model.clone();
        let history_path = self.history_path.clone();
        tokio::spawn(async move {
            let history: Vec<f64> = match docstore::read_json(&history_path) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "retrain skipped: no persisted history");
                    return;
                }
            };
            let current = model.load_full();
            let retrained =
                tokio::task::spawn_blocking(move || current.retrain(&history)).await;
            match retrained {
                Ok(Ok(new_model)) => {
                    model.store(Arc::new(new_model));
                    tracing::info!("forecast model retrained and swapped");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "retrain failed"),
                Err(e) => tracing::warn!(error = %e, "retrain task panicked"),
            }
        });
    }
}
