//! Labeled metrics (§4.H). Generalizes the upstream SDK's lock-free
//! atomic-counter idiom (`proxy::metrics::AtomicMetrics`) from a fixed set of
//! unlabeled fields to arbitrary `name{k=v,...}` label keys, and adds a
//! fixed-bucket histogram for latency.
//!
//! The event-bus half of this component is not a separate type: the
//! Registry's own `broadcast::Sender<ChangeEvent>` (`registry::Registry::
//! subscribe_events`) already is the in-process typed publish/subscribe bus
//! the spec asks for, so nothing further is modeled here.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::transport::ConnectionState;

/// Fixed histogram bucket boundaries, in seconds, per §4.H.
pub const HISTOGRAM_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Debug, Default)]
struct Histogram {
    /// Cumulative counts per bucket boundary (Prometheus-style "le").
    buckets: [AtomicU64; HISTOGRAM_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn observe(&self, seconds: f64) {
        for (bucket, &boundary) in self.buckets.iter().zip(HISTOGRAM_BUCKETS.iter()) {
            if seconds <= boundary {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = (seconds * 1_000_000.0).round().max(0.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: HISTOGRAM_BUCKETS
                .iter()
                .zip(self.buckets.iter())
                .map(|(le, count)| (*le, count.load(Ordering::Relaxed)))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum_seconds: f64,
}

/// Renders `name` plus a sorted `k=v` label set into the flat string key
/// used internally; order-independent so callers don't need to remember a
/// canonical label order.
fn label_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = labels.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let mut key = name.to_string();
    if !sorted.is_empty() {
        key.push('{');
        for (i, (k, v)) in sorted.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key.push('}');
    }
    key
}

/// A single exported metric series: its name, label set, and value.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: MetricValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricValue {
    Counter { value: u64 },
    Gauge { value: i64 },
    Histogram(HistogramSnapshot),
}

/// Lock-free labeled counters/gauges/histograms, keyed by a flattened
/// `name{labels}` string. Readers take a point-in-time snapshot; writers
/// never block on each other (`DashMap` shards + atomics).
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.counters
            .entry(label_key(name, labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.gauges
            .entry(label_key(name, labels))
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], seconds: f64) {
        self.histograms.entry(label_key(name, labels)).or_default().observe(seconds);
    }

    /// `requests_total{method,status}`.
    pub fn record_request(&self, method: &str, status: &str) {
        self.inc_counter("requests_total", &[("method", method), ("status", status)]);
    }

    /// `request_duration_seconds{method}`.
    pub fn observe_request_duration(&self, method: &str, seconds: f64) {
        self.observe_histogram("request_duration_seconds", &[("method", method)], seconds);
    }

    /// `active_connections{server,transport}`.
    pub fn set_active_connections(&self, server: &str, transport: &str, value: i64) {
        self.set_gauge("active_connections", &[("server", server), ("transport", transport)], value);
    }

    /// `tool_calls_total{server,status}`.
    pub fn record_tool_call(&self, server: &str, status: &str) {
        self.inc_counter("tool_calls_total", &[("server", server), ("status", status)]);
    }

    /// `upstream_state{server}`, a gauge mapping connection state to an int
    /// per §4.H (`disconnected=0, connecting=1, connected=2, reconnecting=3,
    /// failed=4`).
    pub fn set_upstream_state(&self, server: &str, state: ConnectionState) {
        self.set_gauge("upstream_state", &[("server", server)], connection_state_code(state));
    }

    /// A JSON snapshot of every series currently tracked, for `GET /metrics`.
    pub fn snapshot(&self) -> Vec<MetricSeries> {
        let mut out = Vec::new();
        for entry in self.counters.iter() {
            let (name, labels) = split_key(entry.key());
            out.push(MetricSeries {
                name,
                labels,
                value: MetricValue::Counter {
                    value: entry.value().load(Ordering::Relaxed),
                },
            });
        }
        for entry in self.gauges.iter() {
            let (name, labels) = split_key(entry.key());
            out.push(MetricSeries {
                name,
                labels,
                value: MetricValue::Gauge {
                    value: entry.value().load(Ordering::Relaxed),
                },
            });
        }
        for entry in self.histograms.iter() {
            let (name, labels) = split_key(entry.key());
            out.push(MetricSeries {
                name,
                labels,
                value: MetricValue::Histogram(entry.value().snapshot()),
            });
        }
        out
    }
}

fn connection_state_code(state: ConnectionState) -> i64 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Reconnecting => 3,
        ConnectionState::Failed => 4,
    }
}

/// Inverse of [`label_key`]: split `name{k=v,k2=v2}` back into parts for the
/// snapshot view. Infallible by construction — every key was built by
/// `label_key` above.
fn split_key(key: &str) -> (String, Vec<(String, String)>) {
    let Some(brace) = key.find('{') else {
        return (key.to_string(), Vec::new());
    };
    let name = key[..brace].to_string();
    let inner = &key[brace + 1..key.len().saturating_sub(1)];
    let labels = inner
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    (name, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = Metrics::new();
        metrics.record_request("tools/call", "ok");
        metrics.record_request("tools/call", "ok");
        metrics.record_request("tools/call", "error");

        let snapshot = metrics.snapshot();
        let ok = snapshot
            .iter()
            .find(|s| s.name == "requests_total" && s.labels.contains(&("status".to_string(), "ok".to_string())))
            .unwrap();
        assert!(matches!(ok.value, MetricValue::Counter { value: 2 }));
    }

    #[test]
    fn gauge_reflects_latest_set_not_a_sum() {
        let metrics = Metrics::new();
        metrics.set_active_connections("fs", "stdio", 1);
        metrics.set_active_connections("fs", "stdio", 3);
        let snapshot = metrics.snapshot();
        let gauge = snapshot.iter().find(|s| s.name == "active_connections").unwrap();
        assert!(matches!(gauge.value, MetricValue::Gauge { value: 3 }));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.observe_request_duration("tools/call", 0.02);
        let snapshot = metrics.snapshot();
        let hist = snapshot.iter().find(|s| s.name == "request_duration_seconds").unwrap();
        match &hist.value {
            MetricValue::Histogram(h) => {
                assert_eq!(h.count, 1);
                // 0.02 falls in every bucket boundary >= 0.025
                assert!(h.buckets.iter().any(|(le, c)| *le == 0.025 && *c == 1));
                assert!(h.buckets.iter().any(|(le, c)| *le == 0.01 && *c == 0));
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn upstream_state_maps_to_stable_ints() {
        assert_eq!(connection_state_code(ConnectionState::Disconnected), 0);
        assert_eq!(connection_state_code(ConnectionState::Connected), 2);
        assert_eq!(connection_state_code(ConnectionState::Failed), 4);
    }

    #[test]
    fn label_key_round_trips_through_split_key() {
        let key = label_key("requests_total", &[("status", "ok"), ("method", "tools/call")]);
        let (name, labels) = split_key(&key);
        assert_eq!(name, "requests_total");
        assert_eq!(labels.len(), 2);
    }
}
