//! Metrics + logger (C12): Prometheus-compatible text exposition. Structured
//! logging itself is handled by `tracing`/`tracing-subscriber` (see
//! `logging`); this module owns the counters/gauges/histograms the gateway
//! reports at `/metrics`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: Arc<RwLock<f64>>,
}

impl Counter {
    fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

#[derive(Debug, Clone)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn dec(&self) {
        *self.value.write() -= 1.0;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

struct HistogramState {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

#[derive(Debug, Clone)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: Arc<Vec<f64>>,
    state: Arc<RwLock<HistogramState>>,
}

impl Histogram {
    fn new(name: &'static str, help: &'static str, bounds: Vec<f64>) -> Self {
        let bucket_counts = vec![0; bounds.len() + 1];
        Self {
            name,
            help,
            bounds: Arc::new(bounds),
            state: Arc::new(RwLock::new(HistogramState {
                bucket_counts,
                sum: 0.0,
                count: 0,
            })),
        }
    }

    pub fn observe(&self, value: f64) {
        let mut state = self.state.write();
        state.sum += value;
        state.count += 1;
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                state.bucket_counts[i] += 1;
            }
        }
        let last = state.bucket_counts.len() - 1;
        state.bucket_counts[last] += 1;
    }
}

/// Fixed latency buckets, in seconds, shared by the push and flush
/// histograms.
fn default_latency_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
}

/// The gateway's fixed set of process-wide metrics. The full set is known
/// up front, so these are plain fields rather than a name-keyed registry.
pub struct Metrics {
    pub push_total_ok: Counter,
    pub push_total_error: Counter,
    pub pull_total_ok: Counter,
    pub pull_total_error: Counter,
    pub flush_total_ok: Counter,
    pub flush_total_error: Counter,
    pub push_latency_seconds: Histogram,
    pub flush_duration_seconds: Histogram,
    pub buffer_bytes: Gauge,
    pub buffer_deltas: Gauge,
    pub ws_connections: Gauge,
    pub http_in_flight: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            push_total_ok: Counter::new("lakesync_push_total_ok", "accepted push requests"),
            push_total_error: Counter::new("lakesync_push_total_error", "failed push requests"),
            pull_total_ok: Counter::new("lakesync_pull_total_ok", "accepted pull requests"),
            pull_total_error: Counter::new("lakesync_pull_total_error", "failed pull requests"),
            flush_total_ok: Counter::new("lakesync_flush_total_ok", "successful buffer flushes"),
            flush_total_error: Counter::new("lakesync_flush_total_error", "failed buffer flushes"),
            push_latency_seconds: Histogram::new(
                "lakesync_push_latency_seconds",
                "push handler latency",
                default_latency_buckets(),
            ),
            flush_duration_seconds: Histogram::new(
                "lakesync_flush_duration_seconds",
                "buffer flush duration",
                default_latency_buckets(),
            ),
            buffer_bytes: Gauge::new("lakesync_buffer_bytes", "current buffer byte size"),
            buffer_deltas: Gauge::new("lakesync_buffer_deltas", "current buffer delta count"),
            ws_connections: Gauge::new("lakesync_ws_connections", "open websocket connections"),
            http_in_flight: Gauge::new("lakesync_http_in_flight", "in-flight http requests"),
        }
    }

    /// Renders the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        write_counter(&mut out, &self.push_total_ok, &[("status", "ok")]);
        write_counter(&mut out, &self.push_total_error, &[("status", "error")]);
        write_counter(&mut out, &self.pull_total_ok, &[("status", "ok")]);
        write_counter(&mut out, &self.pull_total_error, &[("status", "error")]);
        write_counter(&mut out, &self.flush_total_ok, &[("status", "ok")]);
        write_counter(&mut out, &self.flush_total_error, &[("status", "error")]);
        write_histogram(&mut out, &self.push_latency_seconds);
        write_histogram(&mut out, &self.flush_duration_seconds);
        write_gauge(&mut out, &self.buffer_bytes);
        write_gauge(&mut out, &self.buffer_deltas);
        write_gauge(&mut out, &self.ws_connections);
        write_gauge(&mut out, &self.http_in_flight);
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn format_labels(pairs: &[(&str, &str)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{joined}}}")
}

fn write_counter(out: &mut String, counter: &Counter, labels: &[(&str, &str)]) {
    out.push_str(&format!("# HELP {} {}\n", counter.name, counter.help));
    out.push_str(&format!("# TYPE {} counter\n", counter.name));
    out.push_str(&format!(
        "{}{} {}\n",
        counter.name,
        format_labels(labels),
        counter.get()
    ));
}

fn write_gauge(out: &mut String, gauge: &Gauge) {
    out.push_str(&format!("# HELP {} {}\n", gauge.name, gauge.help));
    out.push_str(&format!("# TYPE {} gauge\n", gauge.name));
    out.push_str(&format!("{} {}\n", gauge.name, gauge.get()));
}

fn write_histogram(out: &mut String, histogram: &Histogram) {
    out.push_str(&format!("# HELP {} {}\n", histogram.name, histogram.help));
    out.push_str(&format!("# TYPE {} histogram\n", histogram.name));
    let state = histogram.state.read();
    for (i, bound) in histogram.bounds.iter().enumerate() {
        out.push_str(&format!(
            "{}_bucket{{le=\"{}\"}} {}\n",
            histogram.name, bound, state.bucket_counts[i]
        ));
    }
    out.push_str(&format!(
        "{}_bucket{{le=\"+Inf\"}} {}\n",
        histogram.name,
        state.bucket_counts[state.bucket_counts.len() - 1]
    ));
    out.push_str(&format!("{}_sum {}\n", histogram.name, state.sum));
    out.push_str(&format!("{}_count {}\n", histogram.name, state.count));
}

/// Buffer and process stats returned by `GET /v1/admin/metrics/{gw}`,
/// distinct from the process-wide Prometheus exposition at `/metrics`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayMetricsSnapshot {
    pub buffer_log_size: usize,
    pub buffer_byte_size: usize,
    pub buffer_oldest_age_ms: u64,
    pub ws_connections: u64,
    pub http_in_flight: u64,
    pub push_total_ok: u64,
    pub push_total_error: u64,
}

impl GatewayMetricsSnapshot {
    pub fn label_map(&self) -> HashMap<&'static str, u64> {
        let mut map = HashMap::new();
        map.insert("bufferLogSize", self.buffer_log_size as u64);
        map.insert("bufferByteSize", self.buffer_byte_size as u64);
        map.insert("bufferOldestAgeMs", self.buffer_oldest_age_ms);
        map.insert("wsConnections", self.ws_connections);
        map.insert("httpInFlight", self.http_in_flight);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let metrics = Metrics::new();
        metrics.push_total_ok.inc();
        metrics.push_total_ok.inc();
        assert_eq!(metrics.push_total_ok.get(), 2.0);
    }

    #[test]
    fn gauge_set_and_adjust() {
        let metrics = Metrics::new();
        metrics.buffer_bytes.set(100.0);
        metrics.buffer_bytes.inc();
        assert_eq!(metrics.buffer_bytes.get(), 101.0);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.push_latency_seconds.observe(0.002);
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("lakesync_push_latency_seconds_bucket"));
        assert!(rendered.contains("lakesync_push_latency_seconds_sum"));
    }

    #[test]
    fn render_includes_status_labels() {
        let metrics = Metrics::new();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("status=\"ok\""));
        assert!(rendered.contains("status=\"error\""));
    }
}
