//! Metrics collection for the saga engine.
//!
//! [`MetricsCollector`] keeps counters, histograms, and gauges in
//! memory, produces point-in-time [`MetricsSnapshot`]s with exact
//! percentiles, and renders the Prometheus text format. It also
//! implements [`metrics::Recorder`], so values emitted through the
//! `metrics` facade macros land in the same collector once it is
//! installed.

pub mod collector;
pub mod prometheus;
pub mod recorder;
pub mod snapshot;

pub use collector::{MetricKey, MetricUpdate, MetricsCollector, Timer};
pub use prometheus::PROMETHEUS_CONTENT_TYPE;
pub use snapshot::{BucketCount, CounterSnapshot, GaugeSnapshot, HistogramSnapshot, MetricsSnapshot};
