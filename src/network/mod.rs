//! Subscriber-side transport: session lifecycle, automatic reconnection,
//! and event delivery.
//!
//! [`Subscriber`] drives a single connection through mode negotiation,
//! optional authentication, and subscription, and never reconnects on its
//! own. [`Connector`] wraps a subscriber in a retry loop that replays the
//! retained subscription after every failure. Decoded measurements and
//! lifecycle notifications reach the application through listeners
//! registered on an [`EventDispatcher`].

mod connector;
mod events;
mod subscriber;

pub use connector::{Connector, RetryPolicy};
pub use events::{EventDispatcher, SubscriberListener};
pub use subscriber::{SessionState, Subscriber, SubscriberConfig};
