//! Shared subscription registry.
//!
//! Tracks live wrappers by composite key (deduplication) and by
//! subscription id (notification routing). Both indexes sit behind one
//! mutex. Backend calls never run under it: a new key is first reserved
//! with a pending slot, registered remotely, then committed or rolled back.
//! Concurrent subscribers for a reserved key wait for the outcome: they
//! share a backend failure, and take over the reservation when the
//! registering task is cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use super::wrapper::{CompositeKey, SubscriptionWrapper};
use crate::backend::{BackendError, SubscriptionBackend, TrackingTag};
use crate::flow::{Callback, EventBus};
use crate::observability::metrics::{record_backend_call, set_active_subscriptions};
use crate::payload::PayloadType;

/// Default reason attached to remote subscriptions.
pub const DEFAULT_REASON: &str = "fhirhook subscriber";

/// Error type for subscription operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Concurrent registration for the same criteria failed: {0}")]
    RegistrationFailed(String),

    #[error("Registration already in progress")]
    RegistrationInFlight,
}

/// Registry settings.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Base URL the FHIR server calls back on. Absent or blank disables
    /// the service.
    pub callback_url: Option<String>,
    /// Reason recorded on remote subscriptions.
    pub reason: String,
}

impl RegistryConfig {
    pub fn new(callback_url: Option<String>) -> Self {
        Self {
            callback_url,
            reason: DEFAULT_REASON.to_string(),
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Settings every wrapper of an enabled registry is built from.
#[derive(Clone, Debug)]
pub(crate) struct Registration {
    /// Callback base, always ending in `/`.
    pub(crate) callback_base: String,
    pub(crate) tag: TrackingTag,
    pub(crate) reason: String,
}

impl Registration {
    fn from_config(config: RegistryConfig) -> Option<Self> {
        let url = config.callback_url?;
        let url = url.trim();
        if url.is_empty() {
            return None;
        }

        let callback_base = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        };

        Some(Self {
            tag: TrackingTag::for_callback(&callback_base),
            callback_base,
            reason: config.reason,
        })
    }
}

#[derive(Clone, Debug)]
enum Pending {
    Waiting,
    Committed,
    Failed(String),
    Abandoned,
}

enum Slot {
    Pending(watch::Receiver<Pending>),
    Active(Arc<SubscriptionWrapper>),
}

#[derive(Default)]
struct Index {
    by_key: HashMap<CompositeKey, Slot>,
    by_id: HashMap<String, Arc<SubscriptionWrapper>>,
}

enum Lookup {
    Found(Arc<SubscriptionWrapper>),
    Wait(watch::Receiver<Pending>),
    Reserved(watch::Sender<Pending>),
}

/// Registry of shared remote subscriptions.
pub struct SubscriptionRegistry {
    backend: Arc<dyn SubscriptionBackend>,
    bus: Arc<EventBus>,
    registration: Option<Registration>,
    index: Mutex<Index>,
}

impl SubscriptionRegistry {
    /// Create a registry.
    ///
    /// The registry is disabled when no callback URL is configured: nothing
    /// is ever registered remotely and `subscribe` returns `None`.
    pub fn new(
        config: RegistryConfig,
        backend: Arc<dyn SubscriptionBackend>,
        bus: Arc<EventBus>,
    ) -> Self {
        let registration = Registration::from_config(config);
        match &registration {
            Some(r) => tracing::info!(callback_base = %r.callback_base, "Subscription registry enabled"),
            None => tracing::warn!("No callback URL configured, subscription registry disabled"),
        }

        Self {
            backend,
            bus,
            registration,
            index: Mutex::new(Index::default()),
        }
    }

    /// Check whether the registry is disabled.
    pub fn is_disabled(&self) -> bool {
        self.registration.is_none()
    }

    /// Get the normalized callback base URL.
    pub fn callback_base(&self) -> Option<&str> {
        self.registration.as_ref().map(|r| r.callback_base.as_str())
    }

    /// Get the tag carried by every remote subscription of this registry.
    pub fn tracking_tag(&self) -> Option<&TrackingTag> {
        self.registration.as_ref().map(|r| &r.tag)
    }

    /// Get the event bus callbacks are bound on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe a callback to resources matching `criteria`.
    ///
    /// Identical (payload type, criteria) requests share one wrapper and one
    /// remote registration. A missing payload type means
    /// [`PayloadType::None`].
    ///
    /// # Returns
    ///
    /// The shared wrapper, or `None` when the registry is disabled.
    pub async fn subscribe(
        &self,
        criteria: &str,
        payload_type: Option<PayloadType>,
        callback: Callback,
    ) -> Result<Option<Arc<SubscriptionWrapper>>, SubscriptionError> {
        let Some(registration) = &self.registration else {
            tracing::debug!(criteria, "Registry disabled, ignoring subscribe");
            return Ok(None);
        };

        let payload_type = payload_type.unwrap_or_default();
        let key = CompositeKey::new(payload_type, criteria);
        let wrapper = self
            .acquire(registration, &key, criteria, payload_type)
            .await?;

        self.bus.bind(wrapper.event_name(), callback);
        Ok(Some(wrapper))
    }

    async fn acquire(
        &self,
        registration: &Registration,
        key: &CompositeKey,
        criteria: &str,
        payload_type: PayloadType,
    ) -> Result<Arc<SubscriptionWrapper>, SubscriptionError> {
        loop {
            let lookup = {
                let mut index = self.index.lock();
                let existing = match index.by_key.get(key) {
                    Some(Slot::Active(wrapper)) => Some(Lookup::Found(wrapper.clone())),
                    Some(Slot::Pending(rx)) => Some(Lookup::Wait(rx.clone())),
                    None => None,
                };
                match existing {
                    Some(Lookup::Found(wrapper)) => {
                        wrapper.increment_ref_count();
                        Lookup::Found(wrapper)
                    }
                    Some(lookup) => lookup,
                    None => {
                        let (tx, rx) = watch::channel(Pending::Waiting);
                        index.by_key.insert(key.clone(), Slot::Pending(rx));
                        Lookup::Reserved(tx)
                    }
                }
            };

            match lookup {
                Lookup::Found(wrapper) => {
                    tracing::debug!(
                        subscription_id = %wrapper.subscription_id(),
                        key = %key,
                        ref_count = wrapper.ref_count(),
                        "Reusing shared subscription"
                    );
                    return Ok(wrapper);
                }
                Lookup::Reserved(tx) => {
                    return self
                        .register(registration, key, criteria, payload_type, tx)
                        .await;
                }
                Lookup::Wait(mut rx) => {
                    let outcome = rx
                        .wait_for(|p| !matches!(p, Pending::Waiting))
                        .await
                        .map(|p| p.clone());
                    match outcome {
                        Ok(Pending::Failed(reason)) => {
                            return Err(SubscriptionError::RegistrationFailed(reason))
                        }
                        // Committed: pick up the active wrapper. Abandoned or a
                        // dropped reservation: the key is free, reserve it here.
                        Ok(Pending::Committed | Pending::Waiting | Pending::Abandoned)
                        | Err(_) => continue,
                    }
                }
            }
        }
    }

    async fn register(
        &self,
        registration: &Registration,
        key: &CompositeKey,
        criteria: &str,
        payload_type: PayloadType,
        notify: watch::Sender<Pending>,
    ) -> Result<Arc<SubscriptionWrapper>, SubscriptionError> {
        let reservation = Reservation {
            registry: self,
            key: key.clone(),
            notify: Some(notify),
        };

        let wrapper = Arc::new(SubscriptionWrapper::new(
            criteria,
            payload_type,
            registration,
            self.backend.clone(),
        ));

        match wrapper.initialize().await {
            Ok(()) => {
                reservation.commit(&wrapper);
                tracing::info!(
                    subscription_id = %wrapper.subscription_id(),
                    key = %key,
                    "Created shared subscription"
                );
                Ok(wrapper)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to register subscription");
                reservation.roll_back(Pending::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Release one reference to a wrapper and unbind its callback.
    ///
    /// The last release removes the wrapper from the registry and deletes
    /// the remote subscription. A delete failure is returned, but the
    /// wrapper is gone from the registry either way.
    ///
    /// # Panics
    ///
    /// Panics if the wrapper was already fully released.
    pub async fn unsubscribe(
        &self,
        wrapper: &Arc<SubscriptionWrapper>,
        callback: &Callback,
    ) -> Result<(), SubscriptionError> {
        if !self.bus.unbind(wrapper.event_name(), callback) {
            tracing::debug!(
                subscription_id = %wrapper.subscription_id(),
                "Callback was not bound to subscription"
            );
        }

        let (remaining, active) = {
            let mut index = self.index.lock();
            let remaining = wrapper.decrement_ref_count();
            if remaining == 0 {
                let owned = matches!(
                    index.by_key.get(wrapper.key()),
                    Some(Slot::Active(current)) if Arc::ptr_eq(current, wrapper)
                );
                if owned {
                    index.by_key.remove(wrapper.key());
                }
                index.by_id.remove(wrapper.subscription_id());
            }
            (remaining, index.by_id.len())
        };

        if remaining > 0 {
            return Ok(());
        }

        set_active_subscriptions(active);
        tracing::info!(
            subscription_id = %wrapper.subscription_id(),
            key = %wrapper.key(),
            "Removing shared subscription"
        );
        wrapper.delete().await
    }

    /// Unsubscribe several (wrapper, callback) pairs.
    ///
    /// Every pair is processed; the first error is returned.
    pub async fn unsubscribe_all<I>(&self, pairs: I) -> Result<(), SubscriptionError>
    where
        I: IntoIterator<Item = (Arc<SubscriptionWrapper>, Callback)>,
    {
        let mut first_error = None;
        for (wrapper, callback) in pairs {
            if let Err(e) = self.unsubscribe(&wrapper, &callback).await {
                tracing::warn!(
                    subscription_id = %wrapper.subscription_id(),
                    error = %e,
                    "Failed to unsubscribe"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete every remote subscription carrying this registry's tag.
    ///
    /// Best effort: failures are logged and swallowed.
    pub async fn destroy(&self) {
        let Some(registration) = &self.registration else {
            return;
        };

        let start = Instant::now();
        let result = self.backend.delete_all_by_tag(&registration.tag).await;
        record_backend_call("purge", result.is_ok(), start.elapsed().as_secs_f64());

        match result {
            Ok(()) => tracing::info!(tag = %registration.tag.token(), "Purged tagged subscriptions"),
            Err(e) => tracing::error!(
                tag = %registration.tag.token(),
                error = %e,
                "Error attempting to delete tagged subscriptions"
            ),
        }
    }

    /// Look up a live wrapper by subscription id.
    pub fn lookup(&self, subscription_id: &str) -> Option<Arc<SubscriptionWrapper>> {
        self.index.lock().by_id.get(subscription_id).cloned()
    }

    /// Look up a live wrapper by criteria and payload type.
    pub fn find(
        &self,
        criteria: &str,
        payload_type: Option<PayloadType>,
    ) -> Option<Arc<SubscriptionWrapper>> {
        let key = CompositeKey::new(payload_type.unwrap_or_default(), criteria);
        match self.index.lock().by_key.get(&key) {
            Some(Slot::Active(wrapper)) => Some(wrapper.clone()),
            _ => None,
        }
    }

    /// Get the number of live shared subscriptions.
    pub fn active_count(&self) -> usize {
        self.index.lock().by_id.len()
    }

    /// Get the number of keys with a registration in progress.
    pub fn pending_count(&self) -> usize {
        self.index
            .lock()
            .by_key
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }
}

/// Pending slot owned by the task registering a new key.
///
/// Dropping it without committing (including when the registering future is
/// cancelled) frees the key and wakes any waiters.
struct Reservation<'a> {
    registry: &'a SubscriptionRegistry,
    key: CompositeKey,
    notify: Option<watch::Sender<Pending>>,
}

impl Reservation<'_> {
    fn commit(mut self, wrapper: &Arc<SubscriptionWrapper>) {
        let Some(notify) = self.notify.take() else {
            return;
        };

        let active = {
            let mut index = self.registry.index.lock();
            wrapper.increment_ref_count();
            index
                .by_key
                .insert(self.key.clone(), Slot::Active(wrapper.clone()));
            index
                .by_id
                .insert(wrapper.subscription_id().to_string(), wrapper.clone());
            index.by_id.len()
        };

        set_active_subscriptions(active);
        notify.send_replace(Pending::Committed);
    }

    fn roll_back(mut self, outcome: Pending) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: Pending) {
        let Some(notify) = self.notify.take() else {
            return;
        };

        {
            let mut index = self.registry.index.lock();
            if matches!(index.by_key.get(&self.key), Some(Slot::Pending(_))) {
                index.by_key.remove(&self.key);
            }
        }
        notify.send_replace(outcome);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.notify.is_some() {
            tracing::debug!(key = %self.key, "Registration abandoned, releasing reservation");
            self.release(Pending::Abandoned);
        }
    }
}
