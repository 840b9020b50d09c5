use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of every metric in a collector.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub counters: Vec<CounterSnapshot>,
    pub histograms: Vec<HistogramSnapshot>,
    pub gauges: Vec<GaugeSnapshot>,
}

impl MetricsSnapshot {
    /// Finds a counter by name, ignoring labels.
    pub fn counter(&self, name: &str) -> Option<&CounterSnapshot> {
        self.counters.iter().find(|c| c.name == name)
    }

    /// Finds a histogram by name, ignoring labels.
    pub fn histogram(&self, name: &str) -> Option<&HistogramSnapshot> {
        self.histograms.iter().find(|h| h.name == name)
    }

    /// Finds a gauge by name, ignoring labels.
    pub fn gauge(&self, name: &str) -> Option<&GaugeSnapshot> {
        self.gauges.iter().find(|g| g.name == name)
    }
}

/// A counter's value and its rate since the first increment.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: u64,
    pub rate_per_second: f64,
}

/// Summary statistics for one histogram series.
///
/// `count`, `sum`, and `avg` cover the histogram's full lifetime;
/// `min`, `max`, the percentiles, and the buckets are exact over the
/// retained sample window.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub buckets: Vec<BucketCount>,
}

/// Cumulative count of retained samples at or below an upper bound,
/// using the same bucket boundaries as the Prometheus rendering.
#[derive(Debug, Clone, Serialize)]
pub struct BucketCount {
    pub le: f64,
    pub count: u64,
}

/// A gauge's most recently written value.
#[derive(Debug, Clone, Serialize)]
pub struct GaugeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}
