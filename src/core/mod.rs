//! Core types for the subscriber transport
//!
//! This module contains the error taxonomy, the measurement data model, and
//! the protocol tick/time helpers used throughout the library.

pub mod error;
pub mod time;
pub mod types;

pub use self::error::{Error, Result};
pub use self::time::{Ticks, TICKS_PER_MILLISECOND, TICKS_PER_SECOND, UNIX_EPOCH_TICKS};
pub use self::types::{state_flags, Measurement, MeasurementKey, Metadata, SubscriptionInfo};

/// Protocol version advertised in the operational mode word
pub const PROTOCOL_VERSION: u8 = 0;

/// Default port for publisher connections
pub const DEFAULT_PORT: u16 = 6165;
