//! Payment Metrics
//!
//! Success/failure recording and windowed aggregation. Recording never
//! raises: a sink failure is logged and swallowed so observability can never
//! abort a payment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::core_types::{TimestampMs, now_ms};

/// One recorded payment outcome
#[derive(Debug, Clone)]
pub struct MetricsEvent {
    pub at: TimestampMs,
    pub success: bool,
    pub latency_ms: u64,
    /// Failure reason code; `None` for successes
    pub reason: Option<String>,
}

/// Append-only metrics sink
///
/// External sinks forward to a scraping surface; the in-memory sink also
/// serves windowed queries for aggregation.
pub trait MetricsSink: Send + Sync {
    fn append(&self, event: MetricsEvent) -> anyhow::Result<()>;

    /// Events with `from <= at < to`. Sinks that only forward may return
    /// an empty list.
    fn events_between(&self, from: TimestampMs, to: TimestampMs) -> Vec<MetricsEvent>;
}

/// In-memory sink
#[derive(Default)]
pub struct InMemoryMetricsSink {
    events: Mutex<Vec<MetricsEvent>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn append(&self, event: MetricsEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("metrics sink poisoned"))?
            .push(event);
        Ok(())
    }

    fn events_between(&self, from: TimestampMs, to: TimestampMs) -> Vec<MetricsEvent> {
        match self.events.lock() {
            Ok(events) => events
                .iter()
                .filter(|event| event.at >= from && event.at < to)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Aggregated view over a time window
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub p50_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub p99_latency_ms: Option<u64>,
    pub failures_by_reason: BTreeMap<String, u64>,
}

/// Payment metrics recorder/aggregator
pub struct PaymentMetrics {
    sink: Arc<dyn MetricsSink>,
}

impl PaymentMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    /// Record a captured payment. Never raises.
    pub fn record_success(&self, latency: Duration) {
        self.append(MetricsEvent {
            at: now_ms(),
            success: true,
            latency_ms: latency.as_millis() as u64,
            reason: None,
        });
    }

    /// Record a failed payment with its reason code. Never raises.
    pub fn record_failure(&self, reason: &str, latency: Duration) {
        self.append(MetricsEvent {
            at: now_ms(),
            success: false,
            latency_ms: latency.as_millis() as u64,
            reason: Some(reason.to_string()),
        });
    }

    /// Aggregate counts, latency percentiles, and failure reasons over
    /// `[from, to)`.
    pub fn aggregate(&self, from: TimestampMs, to: TimestampMs) -> MetricsReport {
        let events = self.sink.events_between(from, to);

        let mut latencies: Vec<u64> = events.iter().map(|event| event.latency_ms).collect();
        latencies.sort_unstable();

        let mut failures_by_reason: BTreeMap<String, u64> = BTreeMap::new();
        let mut successes = 0u64;
        for event in &events {
            if event.success {
                successes += 1;
            } else if let Some(reason) = &event.reason {
                *failures_by_reason.entry(reason.clone()).or_insert(0) += 1;
            }
        }

        MetricsReport {
            total: events.len() as u64,
            successes,
            failures: events.len() as u64 - successes,
            p50_latency_ms: percentile(&latencies, 50.0),
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            failures_by_reason,
        }
    }

    fn append(&self, event: MetricsEvent) {
        if let Err(e) = self.sink.append(event) {
            warn!(error = %e, "metrics append failed (swallowed)");
        }
    }
}

/// Percentile from pre-sorted samples
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}
