//! Bridge between the `metrics` facade and [`MetricsCollector`].
//!
//! Installing a collector as the recorder makes every
//! `metrics::counter!`/`gauge!`/`histogram!` call site in the process
//! land in that collector, alongside values recorded directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};

use crate::collector::{MetricKey, MetricsCollector};

fn metric_key(key: &Key) -> MetricKey {
    let labels: BTreeMap<String, String> = key
        .labels()
        .map(|label| (label.key().to_string(), label.value().to_string()))
        .collect();
    MetricKey::new(key.name(), labels)
}

struct CounterHandle {
    collector: MetricsCollector,
    key: MetricKey,
}

impl CounterFn for CounterHandle {
    fn increment(&self, value: u64) {
        self.collector.increment_counter_key(self.key.clone(), value);
    }

    fn absolute(&self, value: u64) {
        self.collector.absolute_counter_key(self.key.clone(), value);
    }
}

struct GaugeHandle {
    collector: MetricsCollector,
    key: MetricKey,
}

impl GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        self.collector.add_to_gauge(self.key.clone(), value);
    }

    fn decrement(&self, value: f64) {
        self.collector.add_to_gauge(self.key.clone(), -value);
    }

    fn set(&self, value: f64) {
        self.collector.set_gauge_key(self.key.clone(), value);
    }
}

struct HistogramHandle {
    collector: MetricsCollector,
    key: MetricKey,
}

impl HistogramFn for HistogramHandle {
    fn record(&self, value: f64) {
        self.collector.observe_histogram_key(self.key.clone(), value);
    }
}

impl Recorder for MetricsCollector {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CounterHandle {
            collector: self.clone(),
            key: metric_key(key),
        }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(GaugeHandle {
            collector: self.clone(),
            key: metric_key(key),
        }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(HistogramHandle {
            collector: self.clone(),
            key: metric_key(key),
        }))
    }
}

impl MetricsCollector {
    /// Installs this collector as the process-wide recorder for the
    /// `metrics` facade macros. Fails if another recorder is already
    /// installed.
    pub fn install_global(&self) -> Result<(), metrics::SetRecorderError<MetricsCollector>> {
        metrics::set_global_recorder(self.clone())?;
        tracing::info!("metrics collector installed as global recorder");
        Ok(())
    }
}
