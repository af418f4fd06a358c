//! Shared subscription wrapper.
//!
//! One wrapper exists per distinct (payload type, criteria) pair. It holds
//! the subscription identity, the reference count and the state of the
//! remote registration:
//!
//! ```text
//! Created ──initialize──▶ Registering ──ok──▶ Active ──delete──▶ Revoked
//!                              │
//!                              └──error──▶ Created (discarded by the registry)
//! ```
//!
//! A revoked wrapper is inert. Deleting it again, or touching its
//! reference count, panics: it means a reference-counting bug in the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use super::registry::{Registration, SubscriptionError};
use crate::backend::{RemoteHandle, SubscriptionBackend, SubscriptionRequest};
use crate::flow::event_name;
use crate::generate_subscription_id;
use crate::observability::metrics::record_backend_call;
use crate::payload::{decode_payload, PayloadError, PayloadType, Resource};

/// Deduplication key: payload type and criteria (`JSON|Patient?name=x`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn new(payload_type: PayloadType, criteria: &str) -> Self {
        Self(format!("{}|{}", payload_type.key_name(), criteria))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observable lifecycle state of a wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapperState {
    Created,
    Registering,
    Active,
    Revoked,
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Registering,
    Active(RemoteHandle),
    Revoked,
}

#[derive(Debug)]
struct Inner {
    lifecycle: Lifecycle,
    ref_count: usize,
}

/// Local handle representing one shared remote subscription.
pub struct SubscriptionWrapper {
    subscription_id: String,
    event_name: String,
    key: CompositeKey,
    request: SubscriptionRequest,
    backend: Arc<dyn SubscriptionBackend>,
    inner: Mutex<Inner>,
    /// Serializes payload decoding and publishing for this subscription,
    /// and keeps deletion from racing an in-progress delivery.
    delivery: Mutex<()>,
}

impl SubscriptionWrapper {
    pub(crate) fn new(
        criteria: &str,
        payload_type: PayloadType,
        registration: &Registration,
        backend: Arc<dyn SubscriptionBackend>,
    ) -> Self {
        let subscription_id = generate_subscription_id();
        let request = SubscriptionRequest {
            criteria: criteria.to_string(),
            payload_type,
            endpoint: format!("{}{}", registration.callback_base, subscription_id),
            tag: registration.tag.clone(),
            reason: registration.reason.clone(),
        };

        Self {
            event_name: event_name(&subscription_id),
            key: CompositeKey::new(payload_type, criteria),
            subscription_id,
            request,
            backend,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Created,
                ref_count: 0,
            }),
            delivery: Mutex::new(()),
        }
    }

    /// Get the immutable subscription id.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Get the event bus channel this subscription delivers on.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Get the deduplication key.
    pub fn key(&self) -> &CompositeKey {
        &self.key
    }

    pub fn criteria(&self) -> &str {
        &self.request.criteria
    }

    pub fn payload_type(&self) -> PayloadType {
        self.request.payload_type
    }

    /// Callback address registered with the backend.
    pub fn endpoint(&self) -> &str {
        &self.request.endpoint
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.inner.lock().ref_count
    }

    /// Get the lifecycle state.
    pub fn state(&self) -> WrapperState {
        match self.inner.lock().lifecycle {
            Lifecycle::Created => WrapperState::Created,
            Lifecycle::Registering => WrapperState::Registering,
            Lifecycle::Active(_) => WrapperState::Active,
            Lifecycle::Revoked => WrapperState::Revoked,
        }
    }

    /// Get the backend handle of the remote registration, once active.
    pub fn remote_handle(&self) -> Option<RemoteHandle> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub(crate) fn increment_ref_count(&self) -> usize {
        let mut inner = self.inner.lock();
        self.assert_not_revoked(&inner);
        inner.ref_count += 1;
        inner.ref_count
    }

    /// Decrement the reference count, never going below zero.
    pub(crate) fn decrement_ref_count(&self) -> usize {
        let mut inner = self.inner.lock();
        self.assert_not_revoked(&inner);
        inner.ref_count = inner.ref_count.saturating_sub(1);
        inner.ref_count
    }

    fn assert_not_revoked(&self, inner: &MutexGuard<'_, Inner>) {
        assert!(
            !matches!(inner.lifecycle, Lifecycle::Revoked),
            "subscription {} used after deletion",
            self.subscription_id
        );
    }

    /// Register the subscription with the backend.
    ///
    /// Idempotent: returns immediately when already active. On failure the
    /// wrapper goes back to `Created` and must not be activated.
    pub async fn initialize(&self) -> Result<(), SubscriptionError> {
        {
            let mut inner = self.inner.lock();
            match inner.lifecycle {
                Lifecycle::Active(_) => return Ok(()),
                Lifecycle::Registering => return Err(SubscriptionError::RegistrationInFlight),
                Lifecycle::Revoked => panic!(
                    "subscription {} initialized after deletion",
                    self.subscription_id
                ),
                Lifecycle::Created => inner.lifecycle = Lifecycle::Registering,
            }
        }

        let start = Instant::now();
        let result = self.backend.create_subscription(&self.request).await;
        record_backend_call("create", result.is_ok(), start.elapsed().as_secs_f64());

        let mut inner = self.inner.lock();
        match result {
            Ok(handle) => {
                tracing::debug!(
                    subscription_id = %self.subscription_id,
                    remote_handle = %handle,
                    "Subscription registered"
                );
                inner.lifecycle = Lifecycle::Active(handle);
                Ok(())
            }
            Err(e) => {
                inner.lifecycle = Lifecycle::Created;
                Err(e.into())
            }
        }
    }

    /// Decode a raw notification body.
    ///
    /// Returns `Ok(None)` for a blank body.
    pub fn parse_payload(&self, raw: &str) -> Result<Option<Resource>, PayloadError> {
        decode_payload(raw)
    }

    /// Enter the delivery section for this subscription.
    ///
    /// Returns `None` once the wrapper has been revoked. Holding the guard
    /// keeps notifications for this subscription in arrival order.
    pub(crate) fn begin_delivery(&self) -> Option<MutexGuard<'_, ()>> {
        let gate = self.delivery.lock();
        if matches!(self.inner.lock().lifecycle, Lifecycle::Revoked) {
            return None;
        }
        Some(gate)
    }

    /// Revoke the remote registration.
    ///
    /// # Panics
    ///
    /// Panics if the wrapper was already deleted or never registered.
    pub async fn delete(&self) -> Result<(), SubscriptionError> {
        let handle = {
            let _gate = self.delivery.lock();
            let mut inner = self.inner.lock();
            match std::mem::replace(&mut inner.lifecycle, Lifecycle::Revoked) {
                Lifecycle::Active(handle) => handle,
                Lifecycle::Revoked => {
                    panic!("subscription {} deleted twice", self.subscription_id)
                }
                other => panic!(
                    "subscription {} deleted before registration completed ({other:?})",
                    self.subscription_id
                ),
            }
        };

        let start = Instant::now();
        let result = self.backend.delete_subscription(&handle).await;
        record_backend_call("delete", result.is_ok(), start.elapsed().as_secs_f64());

        tracing::debug!(
            subscription_id = %self.subscription_id,
            remote_handle = %handle,
            ok = result.is_ok(),
            "Subscription revoked"
        );
        result.map_err(Into::into)
    }
}

impl fmt::Debug for SubscriptionWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionWrapper")
            .field("subscription_id", &self.subscription_id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
