//! Inverse-occupancy weight derivation and document assembly.
//!
//! For the two paths of a route, the raw weight is the reciprocal of
//! the path's expected bytes (plus a small epsilon so an idle path
//! never divides by zero). Normalising within the pair yields the
//! selection ratios published to the fabric selector.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};

use tidal_common::models::{
    BandwidthCost, CostSource, DocumentMetadata, LoadBalancingMode, PathDetail,
    PathSelectionDocument, RouteEntry,
};

pub const DEFAULT_EPSILON: f64 = 1.0;

/// Inverse-occupancy ratios for a path pair: lower expected bytes,
/// higher share. Always sums to 1.
pub fn derive_pair(x0: f64, x1: f64, epsilon: f64) -> (f64, f64) {
    let r0 = 1.0 / (x0.max(0.0) + epsilon);
    let r1 = 1.0 / (x1.max(0.0) + epsilon);
    let sum = r0 + r1;
    (r0 / sum, r1 / sum)
}

/// The expected byte cost of one path of a route.
#[derive(Debug, Clone)]
pub struct PathCost {
    pub via_spine: String,
    pub bytes: f64,
    pub source: CostSource,
}

/// Assemble the publishable document. `routes` is keyed by the
/// directed route (`"src->dst"`) with exactly two path costs per
/// entry.
pub fn build_document(
    iteration: u64,
    mode: LoadBalancingMode,
    using_predictions: bool,
    routes: &BTreeMap<String, [PathCost; 2]>,
    epsilon: f64,
    now: DateTime<Utc>,
) -> PathSelectionDocument {
    let mut weights = BTreeMap::new();
    for (route, costs) in routes {
        let (r0, r1) = derive_pair(costs[0].bytes, costs[1].bytes, epsilon);
        let mut path_details = BTreeMap::new();
        for (index, (cost, ratio)) in costs.iter().zip([r0, r1]).enumerate() {
            path_details.insert(
                format!("path_{index}"),
                PathDetail {
                    via_spine: cost.via_spine.clone(),
                    selection_ratio: ratio,
                    bandwidth_cost: BandwidthCost::new(cost.bytes, cost.source),
                },
            );
        }
        weights.insert(route.clone(), RouteEntry { path_details });
    }

    // Operators read the document in UTC+8.
    let utc8 = FixedOffset::east_opt(8 * 3600).expect("fixed offset");
    PathSelectionDocument {
        metadata: DocumentMetadata {
            timestamp_utc8: now.with_timezone(&utc8).format("%Y-%m-%d %H:%M:%S").to_string(),
            iteration,
            load_balancing_mode: mode,
            using_predictions,
            description: "per-path inverse-occupancy selection weights".to_string(),
        },
        path_selection_weights: weights,
    }
}
