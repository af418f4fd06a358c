//! Inbound notification routing.
//!
//! Resolves the subscription id from the callback path, decodes the payload
//! through the owning wrapper and publishes it on the wrapper's channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::registry::SubscriptionRegistry;
use super::wrapper::SubscriptionWrapper;
use crate::flow::ResourceEvent;
use crate::now_millis;
use crate::observability::metrics::record_notification;
use crate::payload::{PayloadError, Resource};

/// What to do when a notification body cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DecodeFailurePolicy {
    /// Reject the notification and keep routing.
    #[default]
    Drop,
    /// Stop routing for the rest of the process lifetime.
    Disable,
}

/// Result of routing one notification.
#[derive(Debug)]
pub enum NotifyOutcome {
    /// Published to `listeners` callbacks.
    Delivered { listeners: usize },
    /// No live subscription has this id.
    NotFound,
    /// Routing is turned off.
    Disabled,
    /// The payload could not be decoded.
    Rejected(PayloadError),
}

/// Routes inbound notifications to local listeners.
pub struct NotificationRouter {
    registry: Arc<SubscriptionRegistry>,
    policy: DecodeFailurePolicy,
    disabled: AtomicBool,
}

impl NotificationRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>, policy: DecodeFailurePolicy) -> Self {
        let disabled = AtomicBool::new(registry.is_disabled());
        Self {
            registry,
            policy,
            disabled,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> DecodeFailurePolicy {
        self.policy
    }

    /// Check whether routing is turned off.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Route a raw notification body to the subscription's listeners.
    ///
    /// Never calls the backend. Notifications for the same subscription are
    /// decoded and published one at a time, in call order; callbacks run
    /// before this returns (see [`SubscriptionCallback`]).
    ///
    /// [`SubscriptionCallback`]: crate::flow::SubscriptionCallback
    pub fn notify(&self, subscription_id: &str, raw: &str) -> NotifyOutcome {
        self.route(subscription_id, |wrapper| wrapper.parse_payload(raw))
    }

    /// Route a notification body as received on the wire.
    ///
    /// A body that is not UTF-8 is a decode failure and follows the
    /// configured [`DecodeFailurePolicy`].
    pub fn notify_bytes(&self, subscription_id: &str, body: &[u8]) -> NotifyOutcome {
        self.route(subscription_id, |wrapper| {
            wrapper.parse_payload(std::str::from_utf8(body)?)
        })
    }

    fn route<F>(&self, subscription_id: &str, decode: F) -> NotifyOutcome
    where
        F: FnOnce(&SubscriptionWrapper) -> Result<Option<Resource>, PayloadError>,
    {
        if self.is_disabled() {
            record_notification("disabled");
            return NotifyOutcome::Disabled;
        }

        let Some(wrapper) = self.registry.lookup(subscription_id) else {
            tracing::debug!(subscription_id, "Notification for unknown subscription");
            record_notification("not_found");
            return NotifyOutcome::NotFound;
        };

        let Some(_gate) = wrapper.begin_delivery() else {
            record_notification("not_found");
            return NotifyOutcome::NotFound;
        };

        let resource = match decode(&*wrapper) {
            Ok(resource) => resource,
            Err(e) => return self.reject(subscription_id, e),
        };

        let event = ResourceEvent {
            event_name: wrapper.event_name().to_string(),
            subscription_id: subscription_id.to_string(),
            resource,
            received_at: now_millis(),
        };
        let listeners = self.registry.bus().publish(&event);

        tracing::debug!(
            subscription_id,
            resource_type = event.resource.as_ref().map(|r| r.resource_type.as_str()),
            listeners,
            "Notification delivered"
        );
        record_notification("delivered");
        NotifyOutcome::Delivered { listeners }
    }

    fn reject(&self, subscription_id: &str, error: PayloadError) -> NotifyOutcome {
        record_notification("rejected");
        match self.policy {
            DecodeFailurePolicy::Drop => {
                tracing::warn!(subscription_id, error = %error, "Dropping undecodable notification");
            }
            DecodeFailurePolicy::Disable => {
                tracing::error!(
                    subscription_id,
                    error = %error,
                    "Undecodable notification, disabling notification routing"
                );
                self.disabled.store(true, Ordering::Release);
            }
        }
        NotifyOutcome::Rejected(error)
    }
}
