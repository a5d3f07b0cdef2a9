//! Path loop — fabric telemetry, per-path prediction, and weight
//! publication.

pub mod collector;
pub mod predictor;
pub mod runner;
pub mod weights;
