use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::snapshot::{BucketCount, CounterSnapshot, GaugeSnapshot, HistogramSnapshot, MetricsSnapshot};

/// Histogram samples retained for percentile calculation. When the cap
/// is reached the oldest half is dropped; lifetime count and sum are
/// unaffected.
pub(crate) const MAX_RETAINED_SAMPLES: usize = 10_000;

/// Identifies one time series: a metric name plus its label set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    name: String,
    labels: BTreeMap<String, String>,
}

impl MetricKey {
    /// Creates a key from a name and label pairs.
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }

    /// Creates a key with no labels.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, BTreeMap::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

fn label_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug)]
pub(crate) struct CounterState {
    pub(crate) count: u64,
    pub(crate) first_increment: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct HistogramState {
    pub(crate) samples: Vec<f64>,
    pub(crate) count: u64,
    pub(crate) sum: f64,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub(crate) counters: BTreeMap<MetricKey, CounterState>,
    pub(crate) histograms: BTreeMap<MetricKey, HistogramState>,
    pub(crate) gauges: BTreeMap<MetricKey, f64>,
}

impl Inner {
    fn increment_counter(&mut self, key: MetricKey, value: u64) {
        let state = self.counters.entry(key).or_insert_with(|| CounterState {
            count: 0,
            first_increment: Instant::now(),
        });
        state.count += value;
    }

    fn observe_histogram(&mut self, key: MetricKey, value: f64) {
        let state = self.histograms.entry(key).or_default();
        state.count += 1;
        state.sum += value;
        if state.samples.len() >= MAX_RETAINED_SAMPLES {
            let drop_before = state.samples.len() / 2;
            state.samples.drain(..drop_before);
        }
        state.samples.push(value);
    }

    fn set_gauge(&mut self, key: MetricKey, value: f64) {
        self.gauges.insert(key, value);
    }

    fn add_to_gauge(&mut self, key: MetricKey, delta: f64) {
        *self.gauges.entry(key).or_insert(0.0) += delta;
    }
}

/// A single metric mutation, used for batched recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricUpdate {
    Counter {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        value: u64,
    },
    Histogram {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        value: f64,
    },
    Gauge {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        value: f64,
    },
}

/// In-memory metrics store.
///
/// Counters are monotone and report a rate since their first increment.
/// Histograms keep raw samples (capped at [`MAX_RETAINED_SAMPLES`]) so
/// percentiles are exact over the retained window, while count and sum
/// cover the full lifetime. Gauges are last-write-wins. Clones share
/// the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    pub(crate) inner: Arc<RwLock<Inner>>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments an unlabeled counter by 1.
    pub fn increment_counter(&self, name: impl Into<String>) {
        self.increment_counter_by(name, 1);
    }

    /// Increments an unlabeled counter.
    pub fn increment_counter_by(&self, name: impl Into<String>, value: u64) {
        self.inner
            .write()
            .unwrap()
            .increment_counter(MetricKey::bare(name), value);
    }

    /// Increments a labeled counter.
    pub fn increment_counter_labeled(
        &self,
        name: impl Into<String>,
        labels: &[(&str, &str)],
        value: u64,
    ) {
        self.inner
            .write()
            .unwrap()
            .increment_counter(MetricKey::new(name, label_map(labels)), value);
    }

    /// Records one observation in an unlabeled histogram.
    pub fn observe_histogram(&self, name: impl Into<String>, value: f64) {
        self.inner
            .write()
            .unwrap()
            .observe_histogram(MetricKey::bare(name), value);
    }

    /// Records one observation in a labeled histogram.
    pub fn observe_histogram_labeled(
        &self,
        name: impl Into<String>,
        labels: &[(&str, &str)],
        value: f64,
    ) {
        self.inner
            .write()
            .unwrap()
            .observe_histogram(MetricKey::new(name, label_map(labels)), value);
    }

    /// Sets an unlabeled gauge.
    pub fn set_gauge(&self, name: impl Into<String>, value: f64) {
        self.inner
            .write()
            .unwrap()
            .set_gauge(MetricKey::bare(name), value);
    }

    /// Sets a labeled gauge.
    pub fn set_gauge_labeled(&self, name: impl Into<String>, labels: &[(&str, &str)], value: f64) {
        self.inner
            .write()
            .unwrap()
            .set_gauge(MetricKey::new(name, label_map(labels)), value);
    }

    /// Adds `delta` (possibly negative) to an unlabeled gauge, treating
    /// a missing gauge as zero.
    pub fn adjust_gauge(&self, name: impl Into<String>, delta: f64) {
        self.inner
            .write()
            .unwrap()
            .add_to_gauge(MetricKey::bare(name), delta);
    }

    /// Adds `delta` (possibly negative) to a labeled gauge.
    pub fn adjust_gauge_labeled(&self, name: impl Into<String>, labels: &[(&str, &str)], delta: f64) {
        self.inner
            .write()
            .unwrap()
            .add_to_gauge(MetricKey::new(name, label_map(labels)), delta);
    }

    pub(crate) fn add_to_gauge(&self, key: MetricKey, delta: f64) {
        self.inner.write().unwrap().add_to_gauge(key, delta);
    }

    pub(crate) fn increment_counter_key(&self, key: MetricKey, value: u64) {
        self.inner.write().unwrap().increment_counter(key, value);
    }

    pub(crate) fn absolute_counter_key(&self, key: MetricKey, value: u64) {
        let mut inner = self.inner.write().unwrap();
        let state = inner.counters.entry(key).or_insert_with(|| CounterState {
            count: 0,
            first_increment: Instant::now(),
        });
        // Counters are monotone; an absolute write never moves backwards.
        state.count = state.count.max(value);
    }

    pub(crate) fn observe_histogram_key(&self, key: MetricKey, value: f64) {
        self.inner.write().unwrap().observe_histogram(key, value);
    }

    pub(crate) fn set_gauge_key(&self, key: MetricKey, value: f64) {
        self.inner.write().unwrap().set_gauge(key, value);
    }

    /// Starts a timer that records into the named histogram, in seconds.
    pub fn start_timer(&self, name: impl Into<String>) -> Timer {
        self.start_timer_labeled(name, &[])
    }

    /// Starts a labeled timer.
    pub fn start_timer_labeled(&self, name: impl Into<String>, labels: &[(&str, &str)]) -> Timer {
        Timer {
            collector: self.clone(),
            key: MetricKey::new(name, label_map(labels)),
            started: Instant::now(),
            recorded: false,
        }
    }

    /// Applies a batch of updates under a single lock acquisition, so
    /// readers never observe a partially applied batch.
    pub fn record_batch(&self, updates: Vec<MetricUpdate>) {
        let mut inner = self.inner.write().unwrap();
        for update in updates {
            match update {
                MetricUpdate::Counter {
                    name,
                    labels,
                    value,
                } => inner.increment_counter(MetricKey::new(name, labels), value),
                MetricUpdate::Histogram {
                    name,
                    labels,
                    value,
                } => inner.observe_histogram(MetricKey::new(name, labels), value),
                MetricUpdate::Gauge {
                    name,
                    labels,
                    value,
                } => inner.set_gauge(MetricKey::new(name, labels), value),
            }
        }
    }

    /// Current value of an unlabeled counter.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counter_value_labeled(name, &[])
    }

    /// Current value of a labeled counter.
    pub fn counter_value_labeled(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, label_map(labels));
        self.inner
            .read()
            .unwrap()
            .counters
            .get(&key)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Current value of an unlabeled gauge.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.inner
            .read()
            .unwrap()
            .gauges
            .get(&MetricKey::bare(name))
            .copied()
    }

    /// Produces a point-in-time snapshot of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().unwrap();

        let counters = inner
            .counters
            .iter()
            .map(|(key, state)| {
                let elapsed = state.first_increment.elapsed().as_secs_f64();
                let rate_per_second = if elapsed > 0.0 {
                    state.count as f64 / elapsed
                } else {
                    0.0
                };
                CounterSnapshot {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    value: state.count,
                    rate_per_second,
                }
            })
            .collect();

        let histograms = inner
            .histograms
            .iter()
            .map(|(key, state)| {
                let mut sorted = state.samples.clone();
                sorted.sort_by(f64::total_cmp);
                let buckets = crate::prometheus::cumulative_bucket_counts(&sorted)
                    .into_iter()
                    .map(|(le, count)| BucketCount { le, count })
                    .collect();
                HistogramSnapshot {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    count: state.count,
                    sum: state.sum,
                    min: sorted.first().copied().unwrap_or(0.0),
                    max: sorted.last().copied().unwrap_or(0.0),
                    avg: if state.count > 0 {
                        state.sum / state.count as f64
                    } else {
                        0.0
                    },
                    p50: percentile(&sorted, 50.0),
                    p95: percentile(&sorted, 95.0),
                    p99: percentile(&sorted, 99.0),
                    buckets,
                }
            })
            .collect();

        let gauges = inner
            .gauges
            .iter()
            .map(|(key, value)| GaugeSnapshot {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: *value,
            })
            .collect();

        MetricsSnapshot {
            generated_at: chrono::Utc::now(),
            counters,
            histograms,
            gauges,
        }
    }

    /// Removes every metric.
    pub fn reset(&self) {
        *self.inner.write().unwrap() = Inner::default();
    }
}

/// Nearest-rank percentile over an ascending slice.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Measures a duration and records it as a histogram observation in
/// seconds. If never explicitly stopped, it records when dropped.
#[derive(Debug)]
pub struct Timer {
    collector: MetricsCollector,
    key: MetricKey,
    started: Instant,
    recorded: bool,
}

impl Timer {
    /// Stops the timer, records the observation, and returns the
    /// elapsed seconds.
    pub fn stop(mut self) -> f64 {
        self.record()
    }

    fn record(&mut self) -> f64 {
        if self.recorded {
            return 0.0;
        }
        self.recorded = true;
        let elapsed = self.started.elapsed().as_secs_f64();
        self.collector
            .observe_histogram_key(self.key.clone(), elapsed);
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.record();
    }
}
