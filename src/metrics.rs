//! Metrics & Health
//!
//! Request/error/pool/cache counters plus bounded rolling latency buffers
//! (oldest sample evicted first). The health verdict is a pure function of
//! the error rate and pool-hit rate.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Critical above 10% errors or below 50% pool hits; warning above 5%
    /// errors or below 70% pool hits.
    pub fn evaluate(error_rate: f64, pool_hit_rate: f64) -> Self {
        if error_rate > 0.1 || pool_hit_rate < 0.5 {
            Self::Critical
        } else if error_rate > 0.05 || pool_hit_rate < 0.7 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }
}

/// Health query result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub pool_hit_rate: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

/// Latency percentiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_unstable_by(f64::total_cmp);

        let len = sorted.len();
        let at = |idx: usize| sorted.get(idx.min(len - 1)).copied().unwrap_or(0.0);

        Self {
            samples: len,
            avg_ms: sorted.iter().sum::<f64>() / len as f64,
            p50_ms: at(len / 2),
            p90_ms: at(len * 90 / 100),
            p95_ms: at(len * 95 / 100),
            p99_ms: at(len * 99 / 100),
            max_ms: sorted[len - 1],
            min_ms: sorted[0],
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tool_lookups: u64,
}

impl MetricsSnapshot {
    /// Errors over requests; 0 with no traffic
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }

    /// Pool hits over acquisitions; 1 before any acquisition
    pub fn pool_hit_rate(&self) -> f64 {
        let total = self.pool_hits + self.pool_misses;
        if total == 0 {
            1.0
        } else {
            self.pool_hits as f64 / total as f64
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Bounded sample buffer
struct Samples {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Samples {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

/// Real-time metrics collector
pub struct MetricsCollector {
    requests: AtomicU64,
    errors: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    tool_lookups: AtomicU64,
    request_latency: Mutex<Samples>,
    lookup_latency: Mutex<Samples>,
    last_status: AtomicU8,
    started: Instant,
}

impl MetricsCollector {
    pub fn new(sample_size: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            tool_lookups: AtomicU64::new(0),
            request_latency: Mutex::new(Samples::new(sample_size)),
            lookup_latency: Mutex::new(Samples::new(sample_size)),
            last_status: AtomicU8::new(HealthStatus::Healthy.to_u8()),
            started: Instant::now(),
        }
    }

    pub fn record_request(&self, latency_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.request_latency.lock().push(latency_ms);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_hit(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_miss(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_lookup(&self, latency_ms: f64) {
        self.tool_lookups.fetch_add(1, Ordering::Relaxed);
        self.lookup_latency.lock().push(latency_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            tool_lookups: self.tool_lookups.load(Ordering::Relaxed),
        }
    }

    /// Current verdict; logs when it differs from the previous one
    pub fn get_health_status(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        let status = HealthStatus::evaluate(snapshot.error_rate(), snapshot.pool_hit_rate());

        let previous = self.last_status.swap(status.to_u8(), Ordering::Relaxed);
        if previous != status.to_u8() {
            match status {
                HealthStatus::Healthy => info!("Health status: healthy"),
                other => warn!(
                    "Health status: {} (errorRate={:.3}, poolHitRate={:.3})",
                    other.as_str(),
                    snapshot.error_rate(),
                    snapshot.pool_hit_rate()
                ),
            }
        }
        status
    }

    pub fn health_report(&self) -> HealthReport {
        let snapshot = self.snapshot();
        let latency = self.latency_stats();
        HealthReport {
            status: self.get_health_status(),
            error_rate: snapshot.error_rate(),
            pool_hit_rate: snapshot.pool_hit_rate(),
            avg_response_time_ms: latency.avg_ms,
            p95_response_time_ms: latency.p95_ms,
            checked_at: chrono::Utc::now(),
        }
    }

    /// Request latency percentiles
    pub fn latency_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.request_latency.lock().values)
    }

    /// Tool lookup latency percentiles
    pub fn lookup_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.lookup_latency.lock().values)
    }

    /// Prometheus text exposition
    pub fn export_prometheus(&self) -> String {
        let s = self.snapshot();
        let latency = self.latency_stats();
        let mut out = String::new();

        let counters = [
            ("toolserve_requests_total", "Requests served", s.requests),
            ("toolserve_errors_total", "Requests that failed", s.errors),
            (
                "toolserve_pool_hits_total",
                "Session acquisitions served by reuse",
                s.pool_hits,
            ),
            (
                "toolserve_pool_misses_total",
                "Session acquisitions that created a session",
                s.pool_misses,
            ),
            ("toolserve_cache_hits_total", "Result cache hits", s.cache_hits),
            ("toolserve_cache_misses_total", "Result cache misses", s.cache_misses),
            ("toolserve_tool_lookups_total", "Tool index lookups", s.tool_lookups),
        ];
        for (name, help, value) in counters {
            let _ = write!(
                out,
                "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                name, help, name, name, value
            );
        }

        let gauges = [
            ("toolserve_error_rate", "Errors over requests", s.error_rate()),
            ("toolserve_pool_hit_rate", "Pool hits over acquisitions", s.pool_hit_rate()),
            (
                "toolserve_uptime_seconds",
                "Uptime in seconds",
                self.started.elapsed().as_secs_f64(),
            ),
        ];
        for (name, help, value) in gauges {
            let _ = write!(
                out,
                "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
                name, help, name, name, value
            );
        }

        let _ = writeln!(
            out,
            "# HELP toolserve_request_latency_ms Request latency over the sample window"
        );
        let _ = writeln!(out, "# TYPE toolserve_request_latency_ms summary");
        let quantiles = [
            ("0.5", latency.p50_ms),
            ("0.9", latency.p90_ms),
            ("0.95", latency.p95_ms),
            ("0.99", latency.p99_ms),
        ];
        for (quantile, value) in quantiles {
            let _ = writeln!(
                out,
                "toolserve_request_latency_ms{{quantile=\"{}\"}} {}",
                quantile, value
            );
        }
        let _ = writeln!(out, "toolserve_request_latency_ms_count {}", latency.samples);
        out
    }

    pub fn export_json(&self) -> String {
        serde_json::json!({
            "counters": self.snapshot(),
            "latency": self.latency_stats(),
            "lookupLatency": self.lookup_stats(),
            "health": self.health_report(),
        })
        .to_string()
    }

    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.errors,
            &self.pool_hits,
            &self.pool_misses,
            &self.cache_hits,
            &self.cache_misses,
            &self.tool_lookups,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.request_latency.lock().values.clear();
        self.lookup_latency.lock().values.clear();
        self.last_status.store(HealthStatus::Healthy.to_u8(), Ordering::Relaxed);
        info!("Metrics reset");
    }
}

/// Timer for measuring operation latency
pub struct LatencyTimer {
    start: Instant,
    operation: &'static str,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn finish(self) -> f64 {
        let ms = self.elapsed_ms();
        debug!("{}: {:.2}ms", self.operation, ms);
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_thresholds() {
        assert_eq!(HealthStatus::evaluate(0.0, 1.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::evaluate(0.05, 0.7), HealthStatus::Healthy);
        assert_eq!(HealthStatus::evaluate(0.06, 0.9), HealthStatus::Warning);
        assert_eq!(HealthStatus::evaluate(0.0, 0.69), HealthStatus::Warning);
        assert_eq!(HealthStatus::evaluate(0.1, 0.5), HealthStatus::Warning);
        assert_eq!(HealthStatus::evaluate(0.11, 1.0), HealthStatus::Critical);
        assert_eq!(HealthStatus::evaluate(0.0, 0.49), HealthStatus::Critical);
        // Critical takes precedence over warning
        assert_eq!(HealthStatus::evaluate(0.07, 0.3), HealthStatus::Critical);
    }

    #[test]
    fn test_empty_collector_is_healthy() {
        let collector = MetricsCollector::new(100);
        let report = collector.health_report();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.error_rate, 0.0);
        assert_eq!(report.pool_hit_rate, 1.0);
        assert_eq!(report.p95_response_time_ms, 0.0);
    }

    #[test]
    fn test_status_from_counters() {
        let collector = MetricsCollector::new(100);
        for _ in 0..100 {
            collector.record_request(5.0);
        }
        for _ in 0..8 {
            collector.record_error();
        }
        for _ in 0..9 {
            collector.record_pool_hit();
        }
        collector.record_pool_miss();
        assert_eq!(collector.get_health_status(), HealthStatus::Warning);

        for _ in 0..5 {
            collector.record_error();
        }
        assert_eq!(collector.get_health_status(), HealthStatus::Critical);
    }

    #[test]
    fn test_latency_percentiles() {
        let collector = MetricsCollector::new(100);
        for ms in 1..=100 {
            collector.record_request(ms as f64);
        }

        let stats = collector.latency_stats();
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert_eq!(stats.p50_ms, 51.0);
        assert_eq!(stats.p95_ms, 96.0);
        assert!((stats.avg_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_window_evicts_oldest() {
        let collector = MetricsCollector::new(5);
        for ms in 0..10 {
            collector.record_request(ms as f64);
        }

        let stats = collector.latency_stats();
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.min_ms, 5.0);
        assert_eq!(collector.snapshot().requests, 10);
    }

    #[test]
    fn test_lookup_latency_is_separate() {
        let collector = MetricsCollector::new(10);
        collector.record_tool_lookup(0.2);
        collector.record_request(40.0);

        assert_eq!(collector.lookup_stats().max_ms, 0.2);
        assert_eq!(collector.latency_stats().max_ms, 40.0);
        assert_eq!(collector.snapshot().tool_lookups, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let collector = MetricsCollector::new(10);
        collector.record_request(3.0);
        collector.record_cache_hit();

        let text = collector.export_prometheus();
        assert!(text.contains("# TYPE toolserve_requests_total counter"));
        assert!(text.contains("toolserve_requests_total 1\n"));
        assert!(text.contains("toolserve_cache_hits_total 1\n"));
        assert!(text.contains("toolserve_request_latency_ms{quantile=\"0.95\"} 3"));
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new(10);
        collector.record_request(1.0);
        collector.record_error();
        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(collector.latency_stats().samples, 0);
    }

    #[test]
    fn test_export_json_shape() {
        let collector = MetricsCollector::new(10);
        collector.record_request(2.0);
        let value: serde_json::Value = serde_json::from_str(&collector.export_json()).unwrap();
        assert_eq!(value["counters"]["requests"], 1);
        assert_eq!(value["health"]["status"], "healthy");
    }
}
