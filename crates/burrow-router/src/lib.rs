//! Path-keyed routing for the proxy
//!
//! The [`RouteRegistry`] maps a single-segment path such as `/svc1` to the
//! backend serving it. Dialed backends are probed by the [`HealthMonitor`] and
//! evicted after two consecutive refused connections; tunnel backends are
//! resolved through the tunnel broker and never probed.

pub mod health;
pub mod registry;

pub use health::{probe, CycleReport, HealthConfig, HealthMonitor};
pub use registry::{
    normalize_path, validate_segment, BackendDescriptor, InsertOutcome, ProbeOutcome,
    ProbeVerdict, ReplaceSummary, RouteError, RouteOrigin, RouteRegistry, Visit,
};
