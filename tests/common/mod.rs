//! Test utilities for fhirhook integration tests.
//!
//! Provides:
//! - A registry and router wired to an in-memory backend
//! - Recording callbacks
//! - Polling helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use fhirhook::backend::InMemoryBackend;
use fhirhook::flow::{Callback, EventBus, ResourceEvent};
use fhirhook::server::create_app;
use fhirhook::service::{
    DecodeFailurePolicy, NotificationRouter, RegistryConfig, SubscriptionRegistry,
};
use parking_lot::Mutex;

pub const CALLBACK_URL: &str = "http://localhost:8090/fhir-callback";
pub const WEBHOOK_PATH: &str = "/fhir-callback";

/// Registry, router and backend for one test.
pub struct TestFixture {
    pub backend: Arc<InMemoryBackend>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<SubscriptionRegistry>,
    pub router: Arc<NotificationRouter>,
}

impl TestFixture {
    /// Create an enabled fixture.
    pub fn new() -> Self {
        Self::with_backend(InMemoryBackend::new(), Some(CALLBACK_URL), DecodeFailurePolicy::Drop)
    }

    /// Create a fixture without a callback URL.
    pub fn disabled() -> Self {
        Self::with_backend(InMemoryBackend::new(), None, DecodeFailurePolicy::Drop)
    }

    pub fn with_policy(policy: DecodeFailurePolicy) -> Self {
        Self::with_backend(InMemoryBackend::new(), Some(CALLBACK_URL), policy)
    }

    pub fn with_backend(
        backend: InMemoryBackend,
        callback_url: Option<&str>,
        policy: DecodeFailurePolicy,
    ) -> Self {
        fhirhook::observability::tracing::init_test_tracing();

        let backend = Arc::new(backend);
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            RegistryConfig::new(callback_url.map(str::to_string)),
            backend.clone(),
            bus.clone(),
        ));
        let router = Arc::new(NotificationRouter::new(registry.clone(), policy));

        Self {
            backend,
            bus,
            registry,
            router,
        }
    }

    /// Build the webhook application over this fixture's router.
    pub fn app(&self) -> Router {
        create_app(self.router.clone(), WEBHOOK_PATH)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback recording every event it receives.
pub fn recorder() -> (Callback, Arc<Mutex<Vec<ResourceEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: Callback = Arc::new(move |event: &ResourceEvent| sink.lock().push(event.clone()));
    (callback, events)
}

/// Callback that ignores events.
pub fn noop() -> Callback {
    Arc::new(|_: &ResourceEvent| {})
}

/// Wait for a condition to become true with timeout.
///
/// # Arguments
///
/// * `timeout` - Maximum time to wait
/// * `condition` - Closure that returns true when condition is met
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
