//! Metrics-DB client — per-backend live telemetry.
//!
//! Queries a Prometheus-compatible instant-query endpoint for the five
//! series the control plane consumes (CPU %, memory %, request rate,
//! total memory, core count) and assembles them into one `LiveSample`
//! per backend. Results are keyed by the `instance` label, which embeds
//! the backend address.
//!
//! Both the central controller and the edge controller poll through
//! this client independently; neither depends on the other's view.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::models::LiveSample;

/// CPU utilisation percent, 1-minute average.
pub const QUERY_CPU_PCT: &str =
    r#"100 - (avg by (instance) (rate(node_cpu_seconds_total{mode="idle"}[1m])) * 100)"#;
/// Memory utilisation percent.
pub const QUERY_MEM_PCT: &str =
    r#"100 * (1 - (node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes))"#;
/// HTTP requests per second, 1-minute rate.
pub const QUERY_RPS: &str = r#"sum by (instance) (rate(http_requests_total[1m]))"#;
/// Total memory in bytes.
pub const QUERY_TOTAL_MEM: &str = r#"node_memory_MemTotal_bytes"#;
/// Total CPU core count.
pub const QUERY_TOTAL_CORES: &str =
    r#"count by (instance) (count by (cpu, instance) (node_cpu_seconds_total))"#;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("metrics query failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics DB returned status {0}")]
    Status(String),
    #[error("unexpected response shape: {0}")]
    Parse(String),
}

/// One element of an instant-query result vector.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub instance: String,
    pub timestamp: f64,
    pub value: f64,
}

/// Parse the `data.result` vector of an instant-query response.
pub fn parse_instant_vector(body: &Value) -> Result<Vec<InstantSample>, TelemetryError> {
    let status = body["status"].as_str().unwrap_or("missing");
    if status != "success" {
        return Err(TelemetryError::Status(status.to_string()));
    }
    let result = body["data"]["result"]
        .as_array()
        .ok_or_else(|| TelemetryError::Parse("data.result is not an array".into()))?;

    let mut out = Vec::with_capacity(result.len());
    for item in result {
        let instance = item["metric"]["instance"]
            .as_str()
            .ok_or_else(|| TelemetryError::Parse("missing instance label".into()))?
            .to_string();
        let pair = item["value"]
            .as_array()
            .filter(|v| v.len() == 2)
            .ok_or_else(|| TelemetryError::Parse("missing value pair".into()))?;
        let timestamp = pair[0]
            .as_f64()
            .ok_or_else(|| TelemetryError::Parse("non-numeric timestamp".into()))?;
        let value = pair[1]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| TelemetryError::Parse("non-numeric sample value".into()))?;
        out.push(InstantSample {
            instance,
            timestamp,
            value,
        });
    }
    Ok(out)
}

/// Results of the five standing queries, pre-assembly.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub cpu: Vec<InstantSample>,
    pub mem: Vec<InstantSample>,
    pub rps: Vec<InstantSample>,
    pub total_mem: Vec<InstantSample>,
    pub total_cores: Vec<InstantSample>,
}

fn find<'a>(samples: &'a [InstantSample], address: &str) -> Option<&'a InstantSample> {
    samples
        .iter()
        .find(|s| s.instance.split(':').next() == Some(address))
}

/// Assemble one `LiveSample` per backend address. An address is
/// `fresh` only if its CPU and memory series are both present and no
/// older than `max_age_s` relative to `now_unix`; anything else
/// yields a stale placeholder so schedulers can exclude it.
pub fn assemble_samples(
    addresses: &[&str],
    results: &QueryResults,
    now_unix: f64,
    max_age_s: f64,
) -> HashMap<String, LiveSample> {
    let mut out = HashMap::with_capacity(addresses.len());
    for &address in addresses {
        let cpu = find(&results.cpu, address);
        let mem = find(&results.mem, address);
        let sample = match (cpu, mem) {
            (Some(cpu), Some(mem))
                if now_unix - cpu.timestamp <= max_age_s
                    && now_unix - mem.timestamp <= max_age_s =>
            {
                LiveSample {
                    cpu_pct: cpu.value,
                    memory_pct: mem.value,
                    rps: find(&results.rps, address).map_or(0.0, |s| s.value),
                    total_memory_bytes: find(&results.total_mem, address)
                        .map_or(0, |s| s.value as u64),
                    total_cpu_cores: find(&results.total_cores, address)
                        .map_or(0, |s| s.value as u32),
                    fresh: true,
                }
            }
            _ => LiveSample::stale(),
        };
        out.insert(address.to_string(), sample);
    }
    out
}

/// HTTP client for the metrics DB.
pub struct MetricsClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetricsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TelemetryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Run one instant query.
    pub async fn query(&self, expr: &str) -> Result<Vec<InstantSample>, TelemetryError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .query(&[("query", expr)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_instant_vector(&body)
    }

    /// Run all five standing queries concurrently and assemble a
    /// `LiveSample` per backend address.
    pub async fn live_samples(
        &self,
        addresses: &[&str],
        max_age: Duration,
    ) -> Result<HashMap<String, LiveSample>, TelemetryError> {
        let (cpu, mem, rps, total_mem, total_cores) = tokio::try_join!(
            self.query(QUERY_CPU_PCT),
            self.query(QUERY_MEM_PCT),
            self.query(QUERY_RPS),
            self.query(QUERY_TOTAL_MEM),
            self.query(QUERY_TOTAL_CORES),
        )?;
        let results = QueryResults {
            cpu,
            mem,
            rps,
            total_mem,
            total_cores,
        };
        let now_unix = Utc::now().timestamp() as f64;
        Ok(assemble_samples(
            addresses,
            &results,
            now_unix,
            max_age.as_secs_f64(),
        ))
    }
}
