//! Throughput and latency metrics
//!
//! Metrics are emitted through the `metrics` facade and are free when no
//! recorder is installed. Building with the `prometheus` feature installs a
//! Prometheus recorder whose text rendering is served on `/metrics`.
//!
//! # Metrics
//!
//! - `melp_send_total`: Counter of records published, by topic and partition
//! - `melp_send_size_bytes`: Histogram of published body sizes
//! - `melp_receive_total`: Counter of records delivered to callbacks, by
//!   topic, partition and status
//! - `melp_receive_size_bytes`: Histogram of delivered body sizes
//! - `melp_receive_duration_seconds`: Histogram of callback delivery time
//!
//! Optional collectors, switched on under `metrics:` in the configuration
//! and sampled on every scrape:
//!
//! - `melp_runtime_workers`, `melp_runtime_alive_tasks` (`go: true`)
//! - `melp_process_start_time_seconds`, `melp_process_uptime_seconds`
//!   (`process: true`)
//!
//! # Examples
//!
//! ```
//! use melp::metrics::{record_send, DeliveryMetrics};
//!
//! record_send("orders", 0, 128);
//!
//! let metrics = DeliveryMetrics::start("orders", 0, 128);
//! metrics.record("ok");
//! ```

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use metrics::{histogram, increment_counter};

use crate::config::MetricsConfig;

/// Records one published record.
pub fn record_send(topic: &str, partition: i32, size: usize) {
    increment_counter!(
        "melp_send_total",
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    );
    histogram!(
        "melp_send_size_bytes",
        size as f64,
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    );
}

/// Timing for a single callback delivery
///
/// Created before the callback is invoked; [`DeliveryMetrics::record`]
/// emits the counter, size and duration with the final status.
#[derive(Debug)]
pub struct DeliveryMetrics {
    topic: String,
    partition: String,
    size: usize,
    start: Instant,
}

impl DeliveryMetrics {
    /// Starts timing a delivery.
    pub fn start(topic: &str, partition: i32, size: usize) -> Self {
        Self {
            topic: topic.to_string(),
            partition: partition.to_string(),
            size,
            start: Instant::now(),
        }
    }

    /// Records the outcome, `"ok"` or `"error"`.
    pub fn record(self, status: &str) {
        let elapsed = self.start.elapsed();

        increment_counter!(
            "melp_receive_total",
            "topic" => self.topic.clone(),
            "partition" => self.partition.clone(),
            "status" => status.to_string()
        );
        histogram!(
            "melp_receive_size_bytes",
            self.size as f64,
            "topic" => self.topic.clone(),
            "partition" => self.partition.clone(),
            "status" => status.to_string()
        );
        histogram!(
            "melp_receive_duration_seconds",
            elapsed.as_secs_f64(),
            "topic" => self.topic,
            "partition" => self.partition,
            "status" => status.to_string()
        );
    }

    /// Time since the delivery started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Samples the optional collectors enabled in `collectors`.
///
/// Runtime gauges are only produced inside a tokio runtime.
pub fn collector_samples(
    collectors: &MetricsConfig,
    started: SystemTime,
) -> Vec<(&'static str, f64)> {
    let mut samples = Vec::new();
    if collectors.runtime {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let runtime = handle.metrics();
            samples.push(("melp_runtime_workers", runtime.num_workers() as f64));
            samples.push(("melp_runtime_alive_tasks", runtime.num_alive_tasks() as f64));
        }
    }
    if collectors.process {
        let start = started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let uptime = started.elapsed().map(|d| d.as_secs_f64()).unwrap_or_default();
        samples.push(("melp_process_start_time_seconds", start));
        samples.push(("melp_process_uptime_seconds", uptime));
    }
    samples
}

/// Handle used by the HTTP layer to render `/metrics`.
#[derive(Clone)]
pub struct MetricsExporter {
    #[cfg(feature = "prometheus")]
    handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
    collectors: MetricsConfig,
    started: SystemTime,
}

impl Default for MetricsExporter {
    fn default() -> Self {
        Self {
            #[cfg(feature = "prometheus")]
            handle: None,
            collectors: MetricsConfig::default(),
            started: SystemTime::now(),
        }
    }
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("enabled", &self.enabled())
            .field("collectors", &self.collectors)
            .field("started", &self.started)
            .finish()
    }
}

impl MetricsExporter {
    /// An exporter that never renders.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether `/metrics` has anything to serve.
    pub fn enabled(&self) -> bool {
        #[cfg(feature = "prometheus")]
        {
            self.handle.is_some()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            false
        }
    }

    /// Optional collectors sampled on each render.
    pub fn collectors(&self) -> MetricsConfig {
        self.collectors
    }

    /// Prometheus text exposition, if an exporter is installed.
    pub fn render(&self) -> Option<String> {
        #[cfg(feature = "prometheus")]
        {
            let handle = self.handle.as_ref()?;
            for (name, value) in collector_samples(&self.collectors, self.started) {
                metrics::gauge!(name, value);
            }
            Some(handle.render())
        }
        #[cfg(not(feature = "prometheus"))]
        {
            None
        }
    }
}

/// Initializes the metrics exporter
///
/// With the `prometheus` feature this installs the global Prometheus
/// recorder; without it, or if installation fails, the returned exporter is
/// disabled and metrics calls are no-ops.
///
/// # Examples
///
/// ```
/// use melp::config::MetricsConfig;
/// use melp::metrics::init_metrics_exporter;
///
/// let exporter = init_metrics_exporter(MetricsConfig::default());
/// let _ = exporter.render();
/// ```
pub fn init_metrics_exporter(collectors: MetricsConfig) -> MetricsExporter {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => MetricsExporter {
                handle: Some(handle),
                collectors,
                started: SystemTime::now(),
            },
            Err(e) => {
                tracing::warn!("Failed to install Prometheus exporter: {}", e);
                MetricsExporter::disabled()
            }
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        if collectors != MetricsConfig::default() {
            tracing::warn!("metrics collectors configured but the prometheus feature is off");
        }
        MetricsExporter::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_send_without_recorder() {
        record_send("orders", 0, 7);
    }

    #[test]
    fn test_delivery_metrics_record() {
        let metrics = DeliveryMetrics::start("orders", 3, 7);
        assert!(metrics.elapsed() < std::time::Duration::from_secs(1));
        metrics.record("error");
    }

    #[test]
    fn test_disabled_exporter_renders_nothing() {
        let exporter = MetricsExporter::disabled();
        assert!(!exporter.enabled());
        assert!(exporter.render().is_none());
    }

    #[test]
    fn test_no_collectors_by_default() {
        let samples = collector_samples(&MetricsConfig::default(), SystemTime::now());
        assert!(samples.is_empty());
    }

    #[test]
    fn test_process_collector_samples() {
        let started = SystemTime::now() - std::time::Duration::from_secs(5);
        let collectors = MetricsConfig {
            process: true,
            ..Default::default()
        };
        let samples = collector_samples(&collectors, started);
        let names: Vec<&str> = samples.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["melp_process_start_time_seconds", "melp_process_uptime_seconds"]
        );
        assert!(samples[1].1 >= 5.0);
    }

    #[tokio::test]
    async fn test_runtime_collector_samples() {
        let collectors = MetricsConfig {
            runtime: true,
            ..Default::default()
        };
        let samples = collector_samples(&collectors, SystemTime::now());
        assert_eq!(samples[0], ("melp_runtime_workers", 1.0));
        assert_eq!(samples[1].0, "melp_runtime_alive_tasks");
    }

    #[test]
    fn test_runtime_collector_needs_a_runtime() {
        let collectors = MetricsConfig {
            runtime: true,
            process: false,
        };
        assert!(collector_samples(&collectors, SystemTime::now()).is_empty());
    }
}
