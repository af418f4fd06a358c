//! Subscription sharing and notification routing.

pub mod registry;
pub mod router;
pub mod webhook;
pub mod wrapper;

pub use registry::{RegistryConfig, SubscriptionError, SubscriptionRegistry};
pub use router::{DecodeFailurePolicy, NotificationRouter, NotifyOutcome};
pub use wrapper::{CompositeKey, SubscriptionWrapper, WrapperState};
