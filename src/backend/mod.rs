//! Remote subscription backends.
//!
//! Provides:
//! - The [`SubscriptionBackend`] contract consumed by the registry
//! - A FHIR REST implementation with per-version field mappings
//! - An in-memory implementation for local development and tests

pub mod fhir;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::payload::PayloadType;

pub use fhir::{FhirRestBackend, FhirVersion};
pub use memory::InMemoryBackend;

/// Code of the tracking tag placed on every subscription this process creates.
pub const TRACKING_TAG_CODE: &str = "ResourceSubscription";

/// Error type for backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend response did not identify the created subscription")]
    MissingId,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Marker applied to every remote subscription created by this process.
///
/// Used to find and purge orphans left behind by an earlier run, and to
/// tell this process's subscriptions apart from others on a shared server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackingTag {
    pub system: String,
    pub code: String,
}

impl TrackingTag {
    /// Create the tracking tag for a callback base URL.
    pub fn for_callback(callback_url: &str) -> Self {
        Self {
            system: callback_url.to_string(),
            code: TRACKING_TAG_CODE.to_string(),
        }
    }

    /// Token search value (`system|code`).
    pub fn token(&self) -> String {
        format!("{}|{}", self.system, self.code)
    }
}

/// Opaque identifier of a remote subscription record.
///
/// Only the backend that issued a handle knows how to interpret it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a backend needs to create one remote subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Criteria (search expression) to watch.
    pub criteria: String,
    /// Payload encoding the server should send.
    pub payload_type: PayloadType,
    /// Address the server should call back, ending in the subscription id.
    pub endpoint: String,
    /// Tracking tag for orphan cleanup.
    pub tag: TrackingTag,
    /// Human-readable reason recorded on the subscription.
    pub reason: String,
}

/// Contract for the service hosting remote subscription records.
#[async_trait]
pub trait SubscriptionBackend: Send + Sync {
    /// Create a remote subscription and return its handle.
    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RemoteHandle, BackendError>;

    /// Delete one remote subscription.
    async fn delete_subscription(&self, handle: &RemoteHandle) -> Result<(), BackendError>;

    /// Delete every remote subscription carrying the tag.
    async fn delete_all_by_tag(&self, tag: &TrackingTag) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_tag_token() {
        let tag = TrackingTag::for_callback("http://localhost:8090/fhir-callback/");
        assert_eq!(tag.code, TRACKING_TAG_CODE);
        assert_eq!(
            tag.token(),
            "http://localhost:8090/fhir-callback/|ResourceSubscription"
        );
    }
}
