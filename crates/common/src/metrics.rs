//! Metrics collection for ModelServe
//!
//! This module provides Prometheus metrics for observability.
//! Metrics are plain atomics under the hood, so recording them on the
//! scheduling path is cheap.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ModelServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub engine: EngineMetrics,
    pub dispatcher: DispatcherMetrics,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of generation requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Batched generation duration
    pub generation_duration: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Current active requests
    pub active_requests: IntGauge,
}

/// Engine replica metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Current depth of the request queue
    pub queue_depth: IntGauge,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Batches executed
    pub batches_total: IntCounter,

    /// Batches that failed during generation
    pub batch_failures: IntCounter,

    /// Response cache hits
    pub cache_hits: IntCounter,

    /// Response cache misses
    pub cache_misses: IntCounter,

    /// Inserts skipped under memory pressure
    pub cache_skips: IntCounter,

    /// Models currently resident
    pub models_loaded: IntGauge,

    /// Host memory usage percent
    pub host_memory_percent: IntGauge,

    /// Device memory in use, bytes
    pub device_memory_used: IntGauge,

    /// Reclaim passes performed
    pub reclaims_total: IntCounter,
}

/// Dispatcher metrics
#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    /// Requests routed
    pub requests_routed: IntCounter,

    /// Healthy replicas at the last check
    pub healthy_replicas: IntGauge,

    /// Unhealthy replicas at the last check
    pub unhealthy_replicas: IntGauge,

    /// Health probe latency
    pub probe_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("static metric definitions are valid");
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> prometheus::Result<Histogram> {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());
        let r = registry.as_ref();

        let inference = InferenceMetrics {
            requests_total: counter(
                r,
                "inference_requests_total",
                "Total number of generation requests",
            )?,
            requests_success: counter(
                r,
                "inference_requests_success_total",
                "Total number of successful generation requests",
            )?,
            requests_failed: counter(
                r,
                "inference_requests_failed_total",
                "Total number of failed generation requests",
            )?,
            request_duration: histogram(
                r,
                "inference_request_duration_seconds",
                "Generation request duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )?,
            generation_duration: histogram(
                r,
                "inference_generation_duration_seconds",
                "Batched generation duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )?,
            tokens_generated_total: counter(
                r,
                "inference_tokens_generated_total",
                "Total number of tokens generated",
            )?,
            active_requests: gauge(
                r,
                "inference_active_requests",
                "Current number of active generation requests",
            )?,
        };

        let engine = EngineMetrics {
            queue_depth: gauge(r, "engine_queue_depth", "Current depth of the request queue")?,
            batch_size: histogram(
                r,
                "engine_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            )?,
            batches_total: counter(r, "engine_batches_total", "Total number of batches executed")?,
            batch_failures: counter(
                r,
                "engine_batch_failures_total",
                "Total number of batches that failed during generation",
            )?,
            cache_hits: counter(r, "engine_cache_hits_total", "Response cache hits")?,
            cache_misses: counter(r, "engine_cache_misses_total", "Response cache misses")?,
            cache_skips: counter(
                r,
                "engine_cache_skipped_inserts_total",
                "Response cache inserts skipped under memory pressure",
            )?,
            models_loaded: gauge(r, "engine_models_loaded", "Models currently resident")?,
            host_memory_percent: gauge(
                r,
                "engine_host_memory_percent",
                "Host memory usage percentage",
            )?,
            device_memory_used: gauge(
                r,
                "engine_device_memory_used_bytes",
                "Device memory in use in bytes",
            )?,
            reclaims_total: counter(
                r,
                "engine_memory_reclaims_total",
                "Total number of memory reclaim passes",
            )?,
        };

        let dispatcher = DispatcherMetrics {
            requests_routed: counter(
                r,
                "dispatcher_requests_routed_total",
                "Total number of requests routed",
            )?,
            healthy_replicas: gauge(
                r,
                "dispatcher_healthy_replicas",
                "Replicas healthy at the last check",
            )?,
            unhealthy_replicas: gauge(
                r,
                "dispatcher_unhealthy_replicas",
                "Replicas unhealthy at the last check",
            )?,
            probe_duration: histogram(
                r,
                "dispatcher_probe_duration_seconds",
                "Replica health probe duration",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
            )?,
        };

        Ok(MetricsRegistry {
            registry,
            inference,
            engine,
            dispatcher,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new().unwrap();

        metrics.inference.requests_total.inc();
        metrics.engine.queue_depth.set(10);
        metrics.dispatcher.requests_routed.inc();

        let output = metrics.gather().unwrap();
        assert!(output.contains("inference_requests_total"));
        assert!(output.contains("engine_queue_depth 10"));
        assert!(output.contains("dispatcher_requests_routed_total"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new().unwrap();
        let value = metrics.inference.generation_duration.time(|| 42);
        assert_eq!(value, 42);
        assert_eq!(metrics.inference.generation_duration.get_sample_count(), 1);
    }
}
