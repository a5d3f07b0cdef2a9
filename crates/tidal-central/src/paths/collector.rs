//! Fabric byte-counter collection.
//!
//! Polls the SDN controller's port-statistics API for every leaf and
//! spine switch, then derives per-directed-path bytes for the window
//! from counter deltas: the maximum of what the source leaf pushed up
//! its spine uplink and what the destination leaf received back down.
//! A decreasing counter means the port was reset; that path scores 0
//! for the window.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use tidal_common::models::PathKey;
use tidal_common::topology::Topology;

/// Byte counters of one switch port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Counter snapshot across the fabric, keyed by `(dpid, port)`.
pub type CounterMap = HashMap<(u64, u32), PortCounters>;

#[async_trait]
pub trait PortStatsSource: Send + Sync {
    async fn port_stats(&self, dpid: u64) -> anyhow::Result<Vec<(u32, PortCounters)>>;
}

/// REST client for the controller's `/stats/port/{dpid}` endpoint.
pub struct SdnRestClient {
    http: reqwest::Client,
    base_url: String,
}

impl SdnRestClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PortStatsSource for SdnRestClient {
    async fn port_stats(&self, dpid: u64) -> anyhow::Result<Vec<(u32, PortCounters)>> {
        let url = format!("{}/stats/port/{dpid}", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let ports = body[dpid.to_string()]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing port list for dpid {dpid}"))?;
        let mut out = Vec::with_capacity(ports.len());
        for port in ports {
            let Some(port_no) = port["port_no"].as_u64() else {
                // The controller reports the local port as "LOCAL".
                continue;
            };
            out.push((
                port_no as u32,
                PortCounters {
                    rx_bytes: port["rx_bytes"].as_u64().unwrap_or(0),
                    tx_bytes: port["tx_bytes"].as_u64().unwrap_or(0),
                },
            ));
        }
        Ok(out)
    }
}

/// One window's worth of per-path bytes, plus any counter regressions
/// observed while computing it.
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    pub windows: HashMap<PathKey, u64>,
    pub regressions: Vec<String>,
}

pub struct PathCollector {
    topo: Topology,
    prev: Option<CounterMap>,
}

impl PathCollector {
    pub fn new(topo: Topology) -> Self {
        Self { topo, prev: None }
    }

    /// Every dpid the collector polls.
    pub fn dpids(&self) -> Vec<u64> {
        self.topo
            .leaves
            .iter()
            .map(|l| l.dpid)
            .chain(self.topo.spines.iter().map(|s| s.dpid))
            .collect()
    }

    /// Fetch counters for the whole fabric.
    pub async fn fetch(&self, source: &dyn PortStatsSource) -> anyhow::Result<CounterMap> {
        let mut counters = CounterMap::new();
        let results = futures::future::join_all(
            self.dpids().into_iter().map(|dpid| async move {
                (dpid, source.port_stats(dpid).await)
            }),
        )
        .await;
        for (dpid, result) in results {
            let ports = result?;
            for (port_no, c) in ports {
                counters.insert((dpid, port_no), c);
            }
        }
        Ok(counters)
    }

    /// Fold a counter snapshot into per-path window bytes. The first
    /// snapshot only primes the deltas and yields `None`.
    pub fn ingest(&mut self, counters: CounterMap) -> Option<CollectionOutcome> {
        let Some(prev) = self.prev.replace(counters) else {
            return None;
        };
        let current = self.prev.as_ref().expect("just replaced");

        let mut outcome = CollectionOutcome::default();
        for path in self.topo.directed_paths() {
            let bytes = match self.path_window(&prev, current, &path, &mut outcome.regressions) {
                Some(b) => b,
                None => 0,
            };
            outcome.windows.insert(path, bytes);
        }
        Some(outcome)
    }

    fn path_window(
        &self,
        prev: &CounterMap,
        current: &CounterMap,
        path: &PathKey,
        regressions: &mut Vec<String>,
    ) -> Option<u64> {
        let src = self.topo.leaf(&path.src_leaf)?;
        let dst = self.topo.leaf(&path.dst_leaf)?;
        let src_uplink = *src.uplinks.get(&path.spine)?;
        let dst_uplink = *dst.uplinks.get(&path.spine)?;

        let mut delta = |key: (u64, u32), pick: fn(&PortCounters) -> u64| -> Option<u64> {
            let before = pick(prev.get(&key)?);
            let after = pick(current.get(&key)?);
            if after < before {
                regressions.push(format!(
                    "counter regression on dpid {} port {} ({} -> {})",
                    key.0, key.1, before, after
                ));
                return None;
            }
            Some(after - before)
        };

        let up = delta((src.dpid, src_uplink), |c| c.tx_bytes);
        let down = delta((dst.dpid, dst_uplink), |c| c.rx_bytes);
        match (up, down) {
            (Some(up), Some(down)) => Some(up.max(down)),
            // A reset on either port zeroes the whole window.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_common::topology::testutil;

    fn counters(entries: &[((u64, u32), (u64, u64))]) -> CounterMap {
        entries
            .iter()
            .map(|&(key, (rx, tx))| {
                (
                    key,
                    PortCounters {
                        rx_bytes: rx,
                        tx_bytes: tx,
                    },
                )
            })
            .collect()
    }

    /// leaf1 dpid 1 uplinks: spine0 → port 1, spine1 → port 2.
    /// leaf6 dpid 6 mirrors it.
    fn base() -> CounterMap {
        counters(&[
            ((0x1, 1), (0, 0)),
            ((0x1, 2), (0, 0)),
            ((0x6, 1), (0, 0)),
            ((0x6, 2), (0, 0)),
        ])
    }

    #[test]
    fn first_snapshot_only_primes() {
        let mut collector = PathCollector::new(testutil::two_leaf());
        assert!(collector.ingest(base()).is_none());
    }

    #[test]
    fn window_is_max_of_uplink_tx_and_downlink_rx() {
        let mut collector = PathCollector::new(testutil::two_leaf());
        collector.ingest(base());

        // leaf1 pushed 4 MB up to spine0; leaf6 saw 5 MB come down
        // (the spine can merge other traffic) — take the max.
        let outcome = collector
            .ingest(counters(&[
                ((0x1, 1), (0, 4_000_000)),
                ((0x1, 2), (0, 0)),
                ((0x6, 1), (5_000_000, 0)),
                ((0x6, 2), (0, 0)),
            ]))
            .unwrap();

        let path = PathKey::new("leaf1", "spine0", "leaf6");
        assert_eq!(outcome.windows[&path], 5_000_000);
        // The spine1 path saw nothing.
        let quiet = PathKey::new("leaf1", "spine1", "leaf6");
        assert_eq!(outcome.windows[&quiet], 0);
        assert!(outcome.regressions.is_empty());
    }

    #[test]
    fn deltas_are_relative_to_previous_window() {
        let mut collector = PathCollector::new(testutil::two_leaf());
        collector.ingest(base());
        collector.ingest(counters(&[
            ((0x1, 1), (0, 1_000_000)),
            ((0x1, 2), (0, 0)),
            ((0x6, 1), (1_000_000, 0)),
            ((0x6, 2), (0, 0)),
        ]));

        let outcome = collector
            .ingest(counters(&[
                ((0x1, 1), (0, 1_500_000)),
                ((0x1, 2), (0, 0)),
                ((0x6, 1), (1_400_000, 0)),
                ((0x6, 2), (0, 0)),
            ]))
            .unwrap();
        let path = PathKey::new("leaf1", "spine0", "leaf6");
        assert_eq!(outcome.windows[&path], 500_000);
    }

    #[test]
    fn counter_regression_zeroes_the_window_with_a_warning() {
        let mut collector = PathCollector::new(testutil::two_leaf());
        collector.ingest(base());
        collector.ingest(counters(&[
            ((0x1, 1), (0, 9_000_000)),
            ((0x1, 2), (0, 0)),
            ((0x6, 1), (9_000_000, 0)),
            ((0x6, 2), (0, 0)),
        ]));

        // Port reset on leaf1: tx drops to near zero.
        let outcome = collector
            .ingest(counters(&[
                ((0x1, 1), (0, 100)),
                ((0x1, 2), (0, 0)),
                ((0x6, 1), (9_500_000, 0)),
                ((0x6, 2), (0, 0)),
            ]))
            .unwrap();
        let path = PathKey::new("leaf1", "spine0", "leaf6");
        assert_eq!(outcome.windows[&path], 0);
        assert!(!outcome.regressions.is_empty());
    }

    #[test]
    fn every_directed_path_gets_a_window() {
        let mut collector = PathCollector::new(testutil::two_leaf());
        collector.ingest(base());
        let outcome = collector.ingest(base()).unwrap();
        // 2 ordered pairs × 2 spines.
        assert_eq!(outcome.windows.len(), 4);
    }
}
