//! Local event bus for notification delivery.
//!
//! Each shared subscription owns one named channel. Consumers bind a
//! callback to the channel; the router publishes one [`ResourceEvent`] per
//! inbound notification and the bus hands it to every bound callback.
//!
//! Async consumers can bind a [`ChannelListener`] and read the events as a
//! stream instead of running code inside the callback.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::payload::Resource;

/// Prefix of every subscription channel name.
pub const EVENT_ROOT: &str = "FHIR.SUB";

/// Build the channel name for a subscription id.
pub fn event_name(subscription_id: &str) -> String {
    format!("{EVENT_ROOT}.{subscription_id}")
}

/// Notification delivered to local consumers.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    /// Channel the event was published on.
    pub event_name: String,
    /// Subscription the notification arrived for.
    pub subscription_id: String,
    /// Decoded resource; `None` for notifications without content.
    pub resource: Option<Resource>,
    /// Arrival time (Unix milliseconds).
    pub received_at: i64,
}

/// Consumer of subscription notifications.
///
/// `on_event` runs synchronously on the task delivering the notification,
/// while that subscription's delivery order is held. Until it returns,
/// further notifications for the subscription and its revocation wait.
/// Implementations must return quickly, must not block, and must not
/// route another notification for the same subscription from inside the
/// call. Bind a [`ChannelListener`] or spawn a task to do longer work.
pub trait SubscriptionCallback: Send + Sync {
    fn on_event(&self, event: &ResourceEvent);
}

impl<F> SubscriptionCallback for F
where
    F: Fn(&ResourceEvent) + Send + Sync,
{
    fn on_event(&self, event: &ResourceEvent) {
        self(event);
    }
}

/// Shared handle to a callback. Bindings are matched by pointer identity.
pub type Callback = Arc<dyn SubscriptionCallback>;

fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// Event bus keyed by channel name.
///
/// A callback bound twice to the same channel is invoked twice and has to
/// be unbound twice; bindings mirror subscription references.
#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<String, Vec<Callback>>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a callback to a channel.
    pub fn bind(&self, event_name: &str, callback: Callback) {
        self.channels
            .write()
            .entry(event_name.to_string())
            .or_default()
            .push(callback);
    }

    /// Remove one binding of `callback` from a channel.
    ///
    /// Returns false if the callback was not bound to the channel.
    pub fn unbind(&self, event_name: &str, callback: &Callback) -> bool {
        let mut channels = self.channels.write();
        let Some(listeners) = channels.get_mut(event_name) else {
            return false;
        };

        let Some(index) = listeners.iter().position(|c| same_callback(c, callback)) else {
            return false;
        };
        listeners.remove(index);

        if listeners.is_empty() {
            channels.remove(event_name);
        }
        true
    }

    /// Deliver an event to every callback bound to its channel.
    ///
    /// Callbacks run on the caller's task, outside the bus lock, so a
    /// callback may bind or unbind without deadlocking.
    ///
    /// # Returns
    ///
    /// The number of callbacks that received the event.
    pub fn publish(&self, event: &ResourceEvent) -> usize {
        let listeners: Vec<Callback> = self
            .channels
            .read()
            .get(&event.event_name)
            .cloned()
            .unwrap_or_default();

        for listener in &listeners {
            listener.on_event(event);
        }
        listeners.len()
    }

    /// Get the number of callbacks bound to a channel.
    #[must_use]
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.channels
            .read()
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Get the number of channels with at least one binding.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

/// Callback forwarding events into a bounded channel.
///
/// Events are dropped (with a warning) when the reader falls behind by
/// more than the channel capacity.
pub struct ChannelListener {
    sender: mpsc::Sender<ResourceEvent>,
}

impl ChannelListener {
    /// Create a listener and the stream reading from it.
    pub fn new(capacity: usize) -> (Callback, ReceiverStream<ResourceEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let listener: Callback = Arc::new(Self { sender });
        (listener, ReceiverStream::new(receiver))
    }
}

impl SubscriptionCallback for ChannelListener {
    fn on_event(&self, event: &ResourceEvent) {
        if let Err(e) = self.sender.try_send(event.clone()) {
            tracing::warn!(
                event_name = %event.event_name,
                error = %e,
                "Dropping notification for slow or closed listener"
            );
        }
    }
}
