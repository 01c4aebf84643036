//! Offline delivery through registered push endpoints.

pub mod dispatcher;
pub mod subscriptions;
pub mod transport;

pub use dispatcher::{NotificationDispatcher, NotifyReport};
pub use transport::{DeliveryOutcome, HttpPushTransport, PushPayload, PushTransport};
