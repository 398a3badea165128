//! GEP subscriber: streaming time-series exchange client
//!
//! This library implements the subscriber side of the gateway exchange
//! protocol: it negotiates operational modes with a publisher, optionally
//! authenticates, subscribes with a filter expression, and decodes the
//! compact binary measurement stream into timestamped values, handling
//! cipher key rotation and reconnection along the way.

pub mod core;
pub mod network;
pub mod protocol;

// Re-export commonly used items
pub use crate::core::{Error, Measurement, MeasurementKey, Result, SubscriptionInfo, Ticks};
pub use crate::network::{
    Connector, EventDispatcher, RetryPolicy, SessionState, Subscriber, SubscriberConfig,
    SubscriberListener,
};
pub use crate::protocol::{OperationalModes, SignalIndexCache};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
