//! MetaObserver: request metrics and their Prometheus rendering.
//!
//! Collects:
//! - request totals, failures and overloads;
//! - latency (last, EMA, min, max) and a fixed-bucket histogram;
//! - decision breakdown per status;
//! - where each explanation came from (provider, cache, template).
//!
//! Gauges that belong to other components (active requests, queue depth,
//! cache size, model loaded) are passed in at render time.

use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::admission::duration_to_ms;
use crate::error::ComplianceError;
use crate::orchestrator::ExplanationSource;
use crate::policy_core::DecisionStatus;

/// Upper bounds of the latency histogram, seconds.
pub const LATENCY_BUCKETS: [f64; 7] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Latency statistics, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Most recent request.
    pub last_ms: f64,
    /// Exponential moving average.
    pub avg_ms_ema: f64,
    /// Highest observed.
    pub max_ms: f64,
    /// Lowest observed.
    pub min_ms: f64,
}

/// Decisions returned, per status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecisionBreakdown {
    /// `Allowed`.
    pub allowed: u64,
    /// `Restricted`.
    pub restricted: u64,
    /// `Prohibited`.
    pub prohibited: u64,
    /// `Blocked`.
    pub blocked: u64,
}

/// Explanations returned, per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceBreakdown {
    /// Phrased by a model provider.
    pub provider: u64,
    /// Served from the response cache.
    pub cache: u64,
    /// Deterministic template.
    pub template: u64,
    /// Empty question, fixed reply.
    pub empty_question: u64,
}

/// Cumulative latency histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyHistogram {
    /// Cumulative counts per bucket of [`LATENCY_BUCKETS`].
    pub buckets: Vec<u64>,
    /// Sum of all observations, seconds.
    pub sum_secs: f64,
    /// Number of observations.
    pub count: u64,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Last update, milliseconds since the Unix epoch.
    pub last_update_ms: u128,
    /// Requests that returned a decision (success or overload).
    pub total_requests: u64,
    /// Requests that ended in an error.
    pub failed_requests: u64,
    /// Requests rejected by admission control.
    pub overloaded_requests: u64,
    /// Latency stats.
    pub latency: LatencyStats,
    /// Latency histogram.
    pub histogram: LatencyHistogram,
    /// Decision breakdown.
    pub decisions: DecisionBreakdown,
    /// Explanation source breakdown.
    pub sources: SourceBreakdown,
}

/// Gauges owned by other components, sampled at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gauges {
    /// Provider calls in flight.
    pub active_requests: usize,
    /// Requests waiting for a pool slot.
    pub queue_depth: usize,
    /// Response cache entries.
    pub cache_size: usize,
    /// Response cache hits.
    pub cache_hits: u64,
    /// Response cache misses.
    pub cache_misses: u64,
    /// Whether at least one local provider is healthy.
    pub model_loaded: bool,
    /// Current policy snapshot version.
    pub snapshot_version: u64,
}

/// Metric accumulator. Not synchronized; the node keeps it behind a mutex.
#[derive(Debug, Default)]
pub struct MetaObserver {
    total_requests: u64,
    failed_requests: u64,
    overloaded_requests: u64,

    latency_last_ms: f64,
    latency_avg_ema_ms: f64,
    latency_max_ms: f64,
    latency_min_ms: f64,
    latency_samples: u64,

    bucket_counts: [u64; LATENCY_BUCKETS.len()],
    latency_sum_secs: f64,

    decision_allowed: u64,
    decision_restricted: u64,
    decision_prohibited: u64,
    decision_blocked: u64,

    source_provider: u64,
    source_cache: u64,
    source_template: u64,
    source_empty: u64,

    last_update_ms: u128,
}

impl MetaObserver {
    /// All zeros.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn observe_latency(&mut self, latency: Duration) {
        const ALPHA: f64 = 0.1;
        let ms = duration_to_ms(latency);
        self.latency_samples = self.latency_samples.saturating_add(1);
        self.latency_last_ms = ms;
        if self.latency_samples == 1 {
            self.latency_avg_ema_ms = ms;
            self.latency_min_ms = ms;
            self.latency_max_ms = ms;
        } else {
            self.latency_avg_ema_ms = (1.0 - ALPHA).mul_add(self.latency_avg_ema_ms, ALPHA * ms);
            self.latency_max_ms = self.latency_max_ms.max(ms);
            self.latency_min_ms = self.latency_min_ms.min(ms);
        }

        let secs = latency.as_secs_f64();
        self.latency_sum_secs += secs;
        for (count, bound) in self.bucket_counts.iter_mut().zip(LATENCY_BUCKETS) {
            if secs <= bound {
                *count = count.saturating_add(1);
            }
        }
        self.last_update_ms = current_unix_time_ms();
    }

    /// Records a request that produced a decision and an explanation.
    pub fn observe_request(&mut self, status: DecisionStatus, source: ExplanationSource, latency: Duration) {
        self.total_requests = self.total_requests.saturating_add(1);
        let slot = match status {
            DecisionStatus::Allowed => &mut self.decision_allowed,
            DecisionStatus::Restricted => &mut self.decision_restricted,
            DecisionStatus::Prohibited => &mut self.decision_prohibited,
            DecisionStatus::Blocked => &mut self.decision_blocked,
        };
        *slot = slot.saturating_add(1);
        let slot = match source {
            ExplanationSource::Provider => &mut self.source_provider,
            ExplanationSource::Cache => &mut self.source_cache,
            ExplanationSource::Template => &mut self.source_template,
            ExplanationSource::EmptyQuestion => &mut self.source_empty,
        };
        *slot = slot.saturating_add(1);
        self.observe_latency(latency);
    }

    /// Records a request that ended in an error.
    pub fn observe_failure(&mut self, error: &ComplianceError, latency: Duration) {
        self.total_requests = self.total_requests.saturating_add(1);
        self.failed_requests = self.failed_requests.saturating_add(1);
        if error.is_retryable() {
            self.overloaded_requests = self.overloaded_requests.saturating_add(1);
        }
        self.observe_latency(latency);
    }

    /// Immutable copy of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            last_update_ms: self.last_update_ms,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            overloaded_requests: self.overloaded_requests,
            latency: LatencyStats {
                last_ms: self.latency_last_ms,
                avg_ms_ema: self.latency_avg_ema_ms,
                max_ms: self.latency_max_ms,
                min_ms: self.latency_min_ms,
            },
            histogram: LatencyHistogram {
                buckets: self.bucket_counts.to_vec(),
                sum_secs: self.latency_sum_secs,
                count: self.latency_samples,
            },
            decisions: DecisionBreakdown {
                allowed: self.decision_allowed,
                restricted: self.decision_restricted,
                prohibited: self.decision_prohibited,
                blocked: self.decision_blocked,
            },
            sources: SourceBreakdown {
                provider: self.source_provider,
                cache: self.source_cache,
                template: self.source_template,
                empty_question: self.source_empty,
            },
        }
    }

    /// Back to all zeros.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Renders metrics in the Prometheus text exposition format.
#[must_use]
pub fn render_prometheus(snap: &MetricsSnapshot, gauges: &Gauges) -> String {
    let mut out = String::with_capacity(2_048);
    let mut metric = |name: &str, kind: &str, help: &str, lines: &[(String, String)]| {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        for (suffix, value) in lines {
            let _ = writeln!(out, "{name}{suffix} {value}");
        }
    };
    let plain = |v: String| vec![(String::new(), v)];

    metric("compliance_requests_total", "counter", "Total compliance requests", &plain(snap.total_requests.to_string()));
    metric(
        "compliance_requests_failed_total",
        "counter",
        "Requests that ended in an error",
        &plain(snap.failed_requests.to_string()),
    );
    metric(
        "compliance_requests_overloaded_total",
        "counter",
        "Requests rejected by admission control",
        &plain(snap.overloaded_requests.to_string()),
    );
    metric(
        "compliance_decisions_total",
        "counter",
        "Decisions returned by status",
        &[
            ("{status=\"Allowed\"}".into(), snap.decisions.allowed.to_string()),
            ("{status=\"Restricted\"}".into(), snap.decisions.restricted.to_string()),
            ("{status=\"Prohibited\"}".into(), snap.decisions.prohibited.to_string()),
            ("{status=\"Blocked\"}".into(), snap.decisions.blocked.to_string()),
        ],
    );
    metric(
        "compliance_explanations_total",
        "counter",
        "Explanations returned by source",
        &[
            ("{source=\"provider\"}".into(), snap.sources.provider.to_string()),
            ("{source=\"cache\"}".into(), snap.sources.cache.to_string()),
            ("{source=\"template\"}".into(), snap.sources.template.to_string()),
            ("{source=\"empty_question\"}".into(), snap.sources.empty_question.to_string()),
        ],
    );

    let mut histogram: Vec<(String, String)> = LATENCY_BUCKETS
        .iter()
        .zip(&snap.histogram.buckets)
        .map(|(bound, count)| (format!("_bucket{{le=\"{bound}\"}}"), count.to_string()))
        .collect();
    histogram.push(("_bucket{le=\"+Inf\"}".into(), snap.histogram.count.to_string()));
    histogram.push(("_sum".into(), snap.histogram.sum_secs.to_string()));
    histogram.push(("_count".into(), snap.histogram.count.to_string()));
    metric("compliance_request_duration_seconds", "histogram", "Request latency", &histogram);

    metric("compliance_cache_hits_total", "counter", "Response cache hits", &plain(gauges.cache_hits.to_string()));
    metric("compliance_cache_misses_total", "counter", "Response cache misses", &plain(gauges.cache_misses.to_string()));
    metric("compliance_cache_size", "gauge", "Response cache entries", &plain(gauges.cache_size.to_string()));
    metric("compliance_active_requests", "gauge", "Provider calls in flight", &plain(gauges.active_requests.to_string()));
    metric("compliance_queue_depth", "gauge", "Requests waiting for a slot", &plain(gauges.queue_depth.to_string()));
    metric(
        "compliance_model_loaded",
        "gauge",
        "1 if a local model is healthy",
        &plain(u8::from(gauges.model_loaded).to_string()),
    );
    metric(
        "compliance_policy_snapshot_version",
        "gauge",
        "Current policy snapshot version",
        &plain(gauges.snapshot_version.to_string()),
    );
    out
}

/// Current time in milliseconds since 1970-01-01 UTC; 0 on clock error.
fn current_unix_time_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
