//! Prometheus text exposition (format version 0.0.4).

use std::collections::BTreeMap;

use crate::collector::MetricsCollector;

/// Content type to serve alongside [`MetricsCollector::render_prometheus`]
/// output.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Upper bounds for histogram buckets, in seconds.
pub(crate) const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Cumulative counts of `sorted` (ascending) at or below each default
/// bucket boundary.
pub(crate) fn cumulative_bucket_counts(sorted: &[f64]) -> Vec<(f64, u64)> {
    let mut counts = Vec::with_capacity(DEFAULT_BUCKETS.len());
    let mut below = 0usize;
    for boundary in DEFAULT_BUCKETS {
        while below < sorted.len() && sorted[below] <= boundary {
            below += 1;
        }
        counts.push((boundary, below as u64));
    }
    counts
}

impl MetricsCollector {
    /// Renders every metric in the Prometheus text format.
    ///
    /// Histogram buckets are computed from the retained sample window;
    /// the `+Inf` bucket, `_sum`, and `_count` are lifetime totals.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.read().unwrap();
        let mut out = String::new();

        let mut last_name = None::<String>;
        for (key, state) in &inner.counters {
            let name = sanitize_name(key.name());
            if last_name.as_deref() != Some(name.as_str()) {
                out.push_str(&format!("# TYPE {name} counter\n"));
                last_name = Some(name.clone());
            }
            out.push_str(&format!(
                "{name}{} {}\n",
                format_labels(key.labels(), None),
                state.count
            ));
        }

        let mut last_name = None::<String>;
        for (key, value) in &inner.gauges {
            let name = sanitize_name(key.name());
            if last_name.as_deref() != Some(name.as_str()) {
                out.push_str(&format!("# TYPE {name} gauge\n"));
                last_name = Some(name.clone());
            }
            out.push_str(&format!(
                "{name}{} {}\n",
                format_labels(key.labels(), None),
                value
            ));
        }

        let mut last_name = None::<String>;
        for (key, state) in &inner.histograms {
            let name = sanitize_name(key.name());
            if last_name.as_deref() != Some(name.as_str()) {
                out.push_str(&format!("# TYPE {name} histogram\n"));
                last_name = Some(name.clone());
            }

            let mut sorted = state.samples.clone();
            sorted.sort_by(f64::total_cmp);
            for (boundary, below) in cumulative_bucket_counts(&sorted) {
                out.push_str(&format!(
                    "{name}_bucket{} {below}\n",
                    format_labels(key.labels(), Some(("le", boundary.to_string())))
                ));
            }
            out.push_str(&format!(
                "{name}_bucket{} {}\n",
                format_labels(key.labels(), Some(("le", "+Inf".to_string()))),
                state.count
            ));
            out.push_str(&format!(
                "{name}_sum{} {}\n",
                format_labels(key.labels(), None),
                state.sum
            ));
            out.push_str(&format!(
                "{name}_count{} {}\n",
                format_labels(key.labels(), None),
                state.count
            ));
        }

        out
    }
}

/// Replaces characters Prometheus does not allow in metric names.
pub(crate) fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

pub(crate) fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_labels(labels: &BTreeMap<String, String>, extra: Option<(&str, String)>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize_name(k), escape_label_value(v)))
        .collect();
    if let Some((key, value)) = extra {
        pairs.push(format!("{key}=\"{value}\""));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}
