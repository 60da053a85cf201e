//! Metrics for the prover
//!
//! Counters, gauges and bucketed histograms kept in memory and exported as
//! JSON or Prometheus text on `/metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Global metrics registry
pub struct MetricsRegistry {
    /// Counter metrics
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,

    /// Gauge metrics (current values)
    gauges: RwLock<HashMap<String, Arc<AtomicU64>>>,

    /// Histogram metrics (bucketed)
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,

    /// Service start time
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter
    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    /// Add to a counter
    pub async fn add_counter(&self, name: &str, value: u64) {
        let counters = self.counters.read().await;
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Set a gauge value
    pub async fn set_gauge(&self, name: &str, value: u64) {
        let gauges = self.gauges.read().await;
        if let Some(gauge) = gauges.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);

        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), Arc::new(AtomicU64::new(value)));
    }

    /// Get a counter value
    pub async fn get_counter(&self, name: &str) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get a gauge value
    pub async fn get_gauge(&self, name: &str) -> u64 {
        let gauges = self.gauges.read().await;
        gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation using latency buckets
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        self.observe_with(name, value, Histogram::default).await;
    }

    /// Record a long-running duration, in seconds, using buckets up to hours
    pub async fn observe_duration(&self, name: &str, seconds: f64) {
        self.observe_with(name, seconds, Histogram::long_running).await;
    }

    async fn observe_with(&self, name: &str, value: f64, make: fn() -> Histogram) {
        let histograms = self.histograms.read().await;
        if let Some(histogram) = histograms.get(name) {
            histogram.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.histograms.write().await;
        let histogram = histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(make()));
        histogram.observe(value);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get all metrics as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        let counter_values: HashMap<String, u64> = counters
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauge_values: HashMap<String, u64> = gauges
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let histogram_values: HashMap<String, serde_json::Value> = histograms
            .iter()
            .map(|(name, h)| (name.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counter_values,
            "gauges": gauge_values,
            "histograms": histogram_values,
        })
    }

    /// Export metrics in Prometheus format, sorted by name
    pub async fn to_prometheus(&self) -> String {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        let mut output = String::new();

        output.push_str("# HELP prover_uptime_seconds Time since service start\n");
        output.push_str("# TYPE prover_uptime_seconds gauge\n");
        output.push_str(&format!(
            "prover_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let mut names: Vec<&String> = counters.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!("# TYPE {} counter\n", prometheus_name));
            output.push_str(&format!(
                "{} {}\n",
                prometheus_name,
                counters[name].load(Ordering::Relaxed)
            ));
        }

        let mut names: Vec<&String> = gauges.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!("# TYPE {} gauge\n", prometheus_name));
            output.push_str(&format!(
                "{} {}\n",
                prometheus_name,
                gauges[name].load(Ordering::Relaxed)
            ));
        }

        let mut names: Vec<&String> = histograms.keys().collect();
        names.sort();
        for name in names {
            output.push_str(&histograms[name].to_prometheus(name));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Bucketed histogram
pub struct Histogram {
    /// Bucket upper bounds
    buckets: Vec<f64>,

    /// Count per bucket
    counts: Vec<AtomicU64>,

    /// Sum of all observations, in thousandths
    sum: AtomicU64,

    /// Total count of observations
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets for pipeline stages, which run from seconds to hours
    pub fn long_running() -> Self {
        Self::new(vec![
            1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
        ])
    }

    /// Record an observation
    pub fn observe(&self, value: f64) {
        let millis = (value * 1000.0) as u64;
        self.sum.fetch_add(millis, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bound| value <= *bound) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get histogram as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let bucket_counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": bucket_counts,
            "sum": self.sum.load(Ordering::Relaxed) as f64 / 1000.0,
            "count": self.count(),
        })
    }

    /// Export as Prometheus format
    pub fn to_prometheus(&self, name: &str) -> String {
        let prometheus_name = prometheus_name(name);
        let mut output = String::new();

        output.push_str(&format!("# TYPE {} histogram\n", prometheus_name));

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                prometheus_name, bucket, cumulative
            ));
        }

        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            prometheus_name,
            self.count()
        ));
        output.push_str(&format!(
            "{}_sum {}\n",
            prometheus_name,
            self.sum.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        output.push_str(&format!("{}_count {}\n", prometheus_name, self.count()));

        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Latency buckets in seconds
        Self::new(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    // Models
    pub const MODELS_REGISTERED: &str = "prover.models.registered";

    // Job lifecycle
    pub const JOBS_SUBMITTED: &str = "prover.jobs.submitted";
    pub const JOBS_REJECTED: &str = "prover.jobs.rejected";
    pub const JOBS_COMPLETED: &str = "prover.jobs.completed";
    pub const JOBS_FAILED: &str = "prover.jobs.failed";
    pub const JOBS_RETRIED: &str = "prover.jobs.retried";
    pub const JOBS_TIMED_OUT: &str = "prover.jobs.timed_out";
    pub const JOBS_RECOVERED: &str = "prover.jobs.recovered";

    // Artifact cache
    pub const CACHE_HITS: &str = "prover.cache.hits";
    pub const CACHE_MISSES: &str = "prover.cache.misses";

    // Verification
    pub const VERIFICATIONS_VALID: &str = "prover.verifications.valid";
    pub const VERIFICATIONS_INVALID: &str = "prover.verifications.invalid";
    pub const VERIFY_LATENCY: &str = "prover.verify.latency_seconds";

    // Workers
    pub const WORKERS_BUSY: &str = "prover.workers.busy";

    // Retention
    pub const RETENTION_JOBS_CLEANED: &str = "prover.retention.jobs_cleaned";
    pub const RETENTION_BYTES_FREED: &str = "prover.retention.bytes_freed";

    /// Duration of one pipeline stage, e.g. `prover.pipeline_stage_seconds.prove`
    pub fn pipeline_stage(stage: &str) -> String {
        format!("prover.pipeline_stage_seconds.{stage}")
    }

    pub const JOB_DURATION: &str = "prover.job.duration_seconds";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::JOBS_SUBMITTED).await;
        registry.inc_counter(metric_names::JOBS_SUBMITTED).await;
        registry.add_counter(metric_names::JOBS_SUBMITTED, 5).await;

        assert_eq!(registry.get_counter(metric_names::JOBS_SUBMITTED).await, 7);
    }

    #[tokio::test]
    async fn test_gauge() {
        let registry = MetricsRegistry::new();

        registry.set_gauge(metric_names::WORKERS_BUSY, 2).await;
        assert_eq!(registry.get_gauge(metric_names::WORKERS_BUSY).await, 2);

        registry.set_gauge(metric_names::WORKERS_BUSY, 0).await;
        assert_eq!(registry.get_gauge(metric_names::WORKERS_BUSY).await, 0);
    }

    #[tokio::test]
    async fn test_stage_histogram_uses_long_buckets() {
        let registry = MetricsRegistry::new();
        let name = metric_names::pipeline_stage("setup");

        registry.observe_duration(&name, 42.0).await;
        registry.observe_duration(&name, 4000.0).await;

        let json = registry.to_json().await;
        let setup = &json["histograms"][name.as_str()];
        assert_eq!(setup["count"].as_u64(), Some(2));
        assert_eq!(setup["buckets"].as_array().map(|b| b.len()), Some(11));
    }

    #[tokio::test]
    async fn test_prometheus_format() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::CACHE_HITS).await;
        registry.set_gauge(metric_names::WORKERS_BUSY, 1).await;
        registry
            .observe_duration(&metric_names::pipeline_stage("prove"), 3.0)
            .await;

        let prometheus = registry.to_prometheus().await;
        assert!(prometheus.contains("prover_cache_hits 1"));
        assert!(prometheus.contains("prover_workers_busy 1"));
        assert!(prometheus.contains("prover_pipeline_stage_seconds_prove_bucket{le=\"5\"} 1"));
        assert!(prometheus.contains("prover_pipeline_stage_seconds_prove_count 1"));
    }
}
