//! In-memory subscription backend.
//!
//! Keeps subscription records in a map and counts every call, so the
//! registry can be exercised without a FHIR server. Failures and latency
//! can be injected to drive error and concurrency paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendError, RemoteHandle, SubscriptionBackend, SubscriptionRequest, TrackingTag};

/// Backend storing subscription records in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    records: Mutex<HashMap<RemoteHandle, SubscriptionRequest>>,
    next_id: AtomicU64,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    purges: AtomicUsize,
    failing_creates: AtomicUsize,
    failing_deletes: AtomicUsize,
    rejected_criteria: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Make the next `count` create calls fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` delete calls fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Make every create call for `criteria` fail.
    pub fn fail_creates_for(&self, criteria: &str) {
        self.rejected_criteria.lock().insert(criteria.to_string());
    }

    /// Number of create calls received (including failed ones).
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of single delete calls received (including failed ones).
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of delete-by-tag calls received.
    pub fn purge_calls(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    /// Number of subscription records currently held.
    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Get the request a record was created from.
    pub fn record(&self, handle: &RemoteHandle) -> Option<SubscriptionRequest> {
        self.records.lock().get(handle).cloned()
    }

    /// Insert a record directly, as if left behind by an earlier run.
    pub fn seed(&self, request: SubscriptionRequest) -> RemoteHandle {
        let handle = self.next_handle();
        self.records.lock().insert(handle.clone(), request);
        handle
    }

    fn next_handle(&self) -> RemoteHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        RemoteHandle::new(format!("sub-{id}"))
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Consume one injected failure, if any are pending.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SubscriptionBackend for InMemoryBackend {
    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RemoteHandle, BackendError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if take_failure(&self.failing_creates)
            || self.rejected_criteria.lock().contains(&request.criteria)
        {
            return Err(BackendError::Unavailable("injected create failure".into()));
        }

        let handle = self.next_handle();
        self.records.lock().insert(handle.clone(), request.clone());
        Ok(handle)
    }

    async fn delete_subscription(&self, handle: &RemoteHandle) -> Result<(), BackendError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if take_failure(&self.failing_deletes) {
            return Err(BackendError::Unavailable("injected delete failure".into()));
        }

        self.records.lock().remove(handle);
        Ok(())
    }

    async fn delete_all_by_tag(&self, tag: &TrackingTag) -> Result<(), BackendError> {
        self.purges.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        self.records.lock().retain(|_, request| &request.tag != tag);
        Ok(())
    }
}
