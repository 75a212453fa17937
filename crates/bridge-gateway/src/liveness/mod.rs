//! Client liveness checking

mod monitor;

pub use monitor::{sweep, LivenessMonitor, SweepReport};
