//! Per-flow path selection.
//!
//! First packet of an unknown flow: look up both hosts, pick a spine
//! by smooth WRR for the directed route, install the symmetric rule
//! set, and cache the assignment. Later packet-ins for a cached flow
//! (rules lost or expired on the switch side) re-install with the same
//! spine. Multicast, broadcast, and unknown hosts are dropped — the
//! fabric never floods.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tidal_common::models::PathSelectionDocument;
use tidal_common::topology::Topology;

use crate::flow::{FiveTuple, FlowTable};
use crate::rules::{self, RuleInstaller};
use crate::swrr::SmoothWrr;

/// Outcome of handling one packet-in event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// New flow: rules installed, spine chosen (None for same-leaf).
    Forwarded {
        spine: Option<String>,
        rules_installed: usize,
    },
    /// Known flow: same spine re-used.
    CachedFlow { spine: Option<String> },
    Dropped { reason: DropReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MulticastOrBroadcast,
    UnknownHost,
}

pub struct PathSelector<I: RuleInstaller> {
    topo: Topology,
    installer: I,
    routes: HashMap<String, SmoothWrr>,
    flows: FlowTable,
    idle_timeout_s: u32,
    applied: Option<PathSelectionDocument>,
    applications: u64,
}

impl<I: RuleInstaller> PathSelector<I> {
    pub fn new(topo: Topology, installer: I, idle_timeout: Duration) -> Self {
        Self {
            topo,
            installer,
            routes: HashMap::new(),
            flows: FlowTable::new(idle_timeout),
            idle_timeout_s: idle_timeout.as_secs() as u32,
            applied: None,
            applications: 0,
        }
    }

    /// Apply a freshly loaded weight document. Re-applying an
    /// identical document is a no-op (accumulators keep running);
    /// any change rebuilds every route's SWRR state from zero while
    /// cached flows keep their spine. Returns whether the document
    /// was applied.
    pub fn apply_document(&mut self, doc: PathSelectionDocument) -> bool {
        if self.applied.as_ref() == Some(&doc) {
            return false;
        }
        let mut routes = HashMap::new();
        for route_key in doc.path_selection_weights.keys() {
            if let Some(ratios) = doc.route_ratios(route_key) {
                routes.insert(route_key.clone(), SmoothWrr::new(ratios));
            }
        }
        tracing::info!(
            iteration = doc.metadata.iteration,
            routes = routes.len(),
            "path weights applied, accumulators reset"
        );
        self.routes = routes;
        self.applied = Some(doc);
        self.applications += 1;
        true
    }

    /// Number of weight documents actually applied (no-ops excluded).
    pub fn applications(&self) -> u64 {
        self.applications
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Drop idle flow-cache entries.
    pub fn purge_flows(&mut self, now: Instant) {
        self.flows.purge_expired(now);
    }

    /// Handle the first packet of a (possibly known) flow.
    pub async fn handle_packet(
        &mut self,
        tuple: FiveTuple,
        now: Instant,
    ) -> anyhow::Result<Decision> {
        if tuple.dst_ip.is_multicast() || tuple.dst_ip.is_broadcast() {
            return Ok(Decision::Dropped {
                reason: DropReason::MulticastOrBroadcast,
            });
        }

        let src = self.topo.host_location(&tuple.src_ip.to_string());
        let dst = self.topo.host_location(&tuple.dst_ip.to_string());
        let (Some((src_leaf, _)), Some((dst_leaf, _))) = (src, dst) else {
            return Ok(Decision::Dropped {
                reason: DropReason::UnknownHost,
            });
        };
        let src_leaf = src_leaf.name.clone();
        let dst_leaf = dst_leaf.name.clone();

        // Sticky flows re-use their spine for as long as the cache
        // entry (aligned with the rule idle timeout) lives.
        if let Some(cached) = self.flows.get(&tuple, now) {
            let spine = cached.map(str::to_string);
            self.install_for(&tuple, &src_leaf, &dst_leaf, spine.as_deref()).await?;
            return Ok(Decision::CachedFlow { spine });
        }

        if src_leaf == dst_leaf {
            let installed = self.install_for(&tuple, &src_leaf, &dst_leaf, None).await?;
            self.flows.insert(tuple, None, now);
            return Ok(Decision::Forwarded {
                spine: None,
                rules_installed: installed,
            });
        }

        let route_key = format!("{src_leaf}->{dst_leaf}");
        // Routes with no published weights yet get an even split
        // across the configured spines.
        let spines = &self.topo.spines;
        let wrr = self.routes.entry(route_key).or_insert_with(|| {
            SmoothWrr::new([
                (spines[0].name.clone(), 0.5),
                (spines[1].name.clone(), 0.5),
            ])
        });
        let spine = wrr.select().to_string();

        let installed = self
            .install_for(&tuple, &src_leaf, &dst_leaf, Some(&spine))
            .await?;
        self.flows.insert(tuple, Some(spine.clone()), now);
        Ok(Decision::Forwarded {
            spine: Some(spine),
            rules_installed: installed,
        })
    }

    async fn install_for(
        &self,
        tuple: &FiveTuple,
        src_leaf: &str,
        dst_leaf: &str,
        spine: Option<&str>,
    ) -> anyhow::Result<usize> {
        let rules = match spine {
            Some(spine) if src_leaf != dst_leaf => {
                rules::inter_leaf_rules(&self.topo, tuple, spine, self.idle_timeout_s)?
            }
            _ => rules::same_leaf_rules(&self.topo, tuple, self.idle_timeout_s)?,
        };
        for rule in &rules {
            self.installer.install(rule).await?;
        }
        Ok(rules.len())
    }
}
