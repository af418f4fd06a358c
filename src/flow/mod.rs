//! Notification delivery infrastructure.
//!
//! Provides:
//! - Named event channels bound to consumer callbacks
//! - A stream adapter for async consumers

pub mod notify;

pub use notify::{
    event_name, Callback, ChannelListener, EventBus, ResourceEvent, SubscriptionCallback,
};
