//! PostGuard Telemetry
//!
//! Counters for the scoring consumer. Every event is kept in a local atomic
//! snapshot (for logs and tests) and mirrored to the `metrics` facade, which
//! the worker binary exports to Prometheus.

pub mod metrics;

pub use crate::metrics::{describe_metrics, MetricsSnapshot, PipelineMetrics};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::metrics::{MetricsSnapshot, PipelineMetrics};
}
