//! Shared layer for the tidal control plane.
//!
//! These modules are consumed by all three deployable components:
//! the central controller, the edge NAT controller, and the SDN-side
//! fabric selector.

pub mod alerts;
pub mod backoff;
pub mod docstore;
pub mod ewma;
pub mod models;
pub mod telemetry;
pub mod topology;
