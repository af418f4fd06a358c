//! fhirhook: a FHIR resource subscription bridge.
//!
//! Many local consumers can watch the same remote criteria without each of
//! them owning a subscription on the FHIR server. Identical requests share one
//! reference-counted rest-hook subscription, and inbound notifications are
//! routed back to every bound consumer through a local event bus.
//!
//! # Architecture
//!
//! - **Shared subscriptions**: one remote registration per (payload type, criteria)
//! - **Reserve/commit**: backend calls never run under the index lock
//! - **Webhook routing**: `{callback}/{subscription_id}` resolves to local listeners
//! - **Orphan cleanup**: every remote record carries a tracking tag
//!
//! # Modules
//!
//! - [`backend`]: Remote subscription backends (FHIR REST, in-memory)
//! - [`config`]: CLI and environment configuration
//! - [`flow`]: Local event bus for delivering notifications
//! - [`observability`]: Metrics and tracing setup
//! - [`payload`]: Notification payload decoding
//! - [`server`]: Webhook server setup
//! - [`service`]: Subscription registry, wrapper, router and webhook handlers

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // service::registry::SubscriptionRegistry is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod backend;
pub mod config;
pub mod flow;
pub mod observability;
pub mod payload;
pub mod server;
pub mod service;

use uuid::Uuid;

/// Generate a new random subscription ID.
///
/// The id is embedded in the callback URL handed to the FHIR server, so it
/// must not be guessable from previously issued ids.
///
/// # Example
///
/// ```
/// let id = fhirhook::generate_subscription_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
