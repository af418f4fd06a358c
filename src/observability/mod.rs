//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing with pretty or JSON output
//! - Prometheus metrics for backend calls and notifications
//! - HTTP endpoint serving metrics and health

pub mod metrics;
pub mod prometheus;
pub mod tracing;
