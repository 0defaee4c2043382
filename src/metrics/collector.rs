//! Metrics collection using Prometheus
//!
//! This module provides the pipeline's metrics surface: processed, rejected
//! and retried counters, processing latency, and the ordering-key gauge, plus
//! store and service level metrics.

use crate::types::RejectionReason;
use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the rating service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Match pipeline metrics
    pipeline_metrics: PipelineMetrics,

    /// Rating store metrics
    store_metrics: StoreMetrics,

    /// Service-level metrics
    service_metrics: ServiceMetrics,
}

/// Match pipeline metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Matches whose rating changes were committed
    pub matches_processed_total: IntCounter,

    /// Deliveries refused, by reason
    pub matches_rejected_total: IntCounterVec,

    /// Commit attempts that were retried
    pub matches_retried_total: IntCounter,

    /// Re-deliveries of already committed matches
    pub matches_duplicate_total: IntCounter,

    /// Time from receipt to commit
    pub match_processing_latency_seconds: Histogram,

    /// Player keys currently reserved by in-flight work
    pub pending_ordering_keys: IntGauge,
}

/// Rating store metrics
#[derive(Clone)]
pub struct StoreMetrics {
    /// Commit transaction duration
    pub commit_duration_seconds: Histogram,

    /// Ratings widened by inactivity decay
    pub decay_updates_total: IntCounter,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Rating change notifications, labelled `status` = `success` or `error`
    pub notifications_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let pipeline_metrics = PipelineMetrics::new(&registry)?;
        let store_metrics = StoreMetrics::new(&registry)?;
        let service_metrics = ServiceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            pipeline_metrics,
            store_metrics,
            service_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn pipeline(&self) -> &PipelineMetrics {
        &self.pipeline_metrics
    }

    pub fn store(&self) -> &StoreMetrics {
        &self.store_metrics
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Record a committed match and its end-to-end latency
    pub fn record_processed(&self, latency: Duration) {
        self.pipeline_metrics.matches_processed_total.inc();
        self.pipeline_metrics
            .match_processing_latency_seconds
            .observe(latency.as_secs_f64());
    }

    pub fn record_rejected(&self, reason: RejectionReason) {
        self.pipeline_metrics
            .matches_rejected_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn record_retry(&self) {
        self.pipeline_metrics.matches_retried_total.inc();
    }

    pub fn record_duplicate(&self) {
        self.pipeline_metrics.matches_duplicate_total.inc();
    }

    pub fn set_pending_ordering_keys(&self, keys: usize) {
        self.pipeline_metrics
            .pending_ordering_keys
            .set(keys as i64);
    }

    pub fn record_commit(&self, duration: Duration) {
        self.store_metrics
            .commit_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_decay_updates(&self, players: usize) {
        self.store_metrics
            .decay_updates_total
            .inc_by(players as u64);
    }

    pub fn record_notification(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.service_metrics
            .notifications_total
            .with_label_values(&[status])
            .inc();
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    pub fn update_uptime(&self, uptime: Duration) {
        self.service_metrics
            .uptime_seconds
            .set(uptime.as_secs() as i64);
    }

    /// Total for one rejection reason
    pub fn rejected_count(&self, reason: RejectionReason) -> u64 {
        self.pipeline_metrics
            .matches_rejected_total
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl PipelineMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_processed_total = IntCounter::new(
            "matches_processed_total",
            "Matches whose rating changes were committed",
        )?;
        registry.register(Box::new(matches_processed_total.clone()))?;

        let matches_rejected_total = IntCounterVec::new(
            Opts::new("matches_rejected_total", "Match deliveries rejected"),
            &["reason"],
        )?;
        registry.register(Box::new(matches_rejected_total.clone()))?;

        let matches_retried_total = IntCounter::new(
            "matches_retried_total",
            "Match commit attempts that were retried",
        )?;
        registry.register(Box::new(matches_retried_total.clone()))?;

        let matches_duplicate_total = IntCounter::new(
            "matches_duplicate_total",
            "Re-deliveries of already processed matches",
        )?;
        registry.register(Box::new(matches_duplicate_total.clone()))?;

        let match_processing_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "match_processing_latency_seconds",
                "Time from receipt to committed rating update",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(match_processing_latency_seconds.clone()))?;

        let pending_ordering_keys = IntGauge::new(
            "pending_ordering_keys",
            "Player ordering keys reserved by in-flight work",
        )?;
        registry.register(Box::new(pending_ordering_keys.clone()))?;

        Ok(Self {
            matches_processed_total,
            matches_rejected_total,
            matches_retried_total,
            matches_duplicate_total,
            match_processing_latency_seconds,
            pending_ordering_keys,
        })
    }
}

impl StoreMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let commit_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "rating_store_commit_duration_seconds",
                "Rating store commit duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(commit_duration_seconds.clone()))?;

        let decay_updates_total = IntCounter::new(
            "rating_decay_updates_total",
            "Ratings widened by inactivity decay",
        )?;
        registry.register(Box::new(decay_updates_total.clone()))?;

        Ok(Self {
            commit_duration_seconds,
            decay_updates_total,
        })
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::new(
            "rating_service_uptime_seconds",
            "Service uptime in seconds",
        )?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let notifications_total = IntCounterVec::new(
            Opts::new(
                "rating_service_notifications_total",
                "Rating change notifications published",
            ),
            &["status"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        let health_status = IntGauge::new(
            "rating_service_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("rating_service_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            notifications_total,
            health_status,
            component_health,
        })
    }
}
