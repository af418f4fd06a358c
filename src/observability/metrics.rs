//! Prometheus metrics implementation.
//!
//! Key metrics:
//! - fhirhook_active_subscriptions: Gauge of live shared subscriptions
//! - fhirhook_backend_calls_total: Counter of backend calls by operation and outcome
//! - fhirhook_backend_latency_seconds: Histogram of backend call latency
//! - fhirhook_notifications_total: Counter of inbound notifications by outcome

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// fhirhook metrics registry.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    /// Number of shared subscriptions currently registered.
    pub active_subscriptions: IntGauge,
    /// Backend calls by operation (`create`, `delete`, `purge`) and outcome.
    pub backend_calls: IntCounterVec,
    /// Backend call latency in seconds by operation.
    pub backend_latency: HistogramVec,
    /// Inbound notifications by outcome.
    pub notifications: IntCounterVec,
}

impl Metrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("fhirhook".to_string()), None)?;

        let active_subscriptions = IntGauge::new(
            "active_subscriptions",
            "Number of shared subscriptions currently registered",
        )?;
        let backend_calls = IntCounterVec::new(
            Opts::new("backend_calls_total", "Backend calls by operation and outcome"),
            &["operation", "outcome"],
        )?;
        let backend_latency = HistogramVec::new(
            HistogramOpts::new("backend_latency_seconds", "Backend call latency"),
            &["operation"],
        )?;
        let notifications = IntCounterVec::new(
            Opts::new("notifications_total", "Inbound notifications by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(active_subscriptions.clone()))?;
        registry.register(Box::new(backend_calls.clone()))?;
        registry.register(Box::new(backend_latency.clone()))?;
        registry.register(Box::new(notifications.clone()))?;

        Ok(Self {
            registry,
            active_subscriptions,
            backend_calls,
            backend_latency,
            notifications,
        })
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
pub fn init_metrics() {
    if METRICS.get().is_some() {
        return;
    }

    match Metrics::new() {
        Ok(metrics) => {
            // Losing a concurrent init race is fine; the winner is equivalent.
            let _ = METRICS.set(metrics);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to create metrics, metrics disabled"),
    }
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Get the registry holding all fhirhook metrics.
pub fn prometheus_registry() -> Registry {
    init_metrics();
    METRICS
        .get()
        .map(|m| m.registry.clone())
        .unwrap_or_default()
}

/// Record a backend call.
pub fn record_backend_call(operation: &str, success: bool, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let outcome = if success { "ok" } else { "error" };
        m.backend_calls
            .with_label_values(&[operation, outcome])
            .inc();
        m.backend_latency
            .with_label_values(&[operation])
            .observe(latency_seconds);
    }
}

/// Record the number of live shared subscriptions.
pub fn set_active_subscriptions(count: usize) {
    if let Some(m) = METRICS.get() {
        m.active_subscriptions
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

/// Record the outcome of an inbound notification.
pub fn record_notification(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.notifications.with_label_values(&[outcome]).inc();
    }
}
