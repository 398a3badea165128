use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use super::error::{Error, Result};
use super::time::Ticks;

/// Measurement quality flags carried in the 32-bit state word
pub mod state_flags {
    /// Measurement is normal
    pub const NORMAL: u32 = 0x0;
    /// A data range flag was set
    pub const DATA_RANGE: u32 = 0x0000_0001;
    /// A data quality flag was set
    pub const DATA_QUALITY: u32 = 0x0000_0002;
    /// A time quality flag was set
    pub const TIME_QUALITY: u32 = 0x0000_0004;
    /// A system issue flag was set
    pub const SYSTEM_ISSUE: u32 = 0x0000_0008;
    /// Value is calculated rather than measured
    pub const CALCULATED_VALUE: u32 = 0x0000_0010;
    /// Value was discarded upstream
    pub const DISCARDED_VALUE: u32 = 0x0000_0020;
}

/// Identity of a measurement: a globally unique signal id plus the
/// descriptive source/id pair it was published under.
///
/// Equality and hashing are defined solely by the signal id. Two keys with
/// the same signal id but different source or numeric id compare equal.
#[derive(Debug, Clone, Eq)]
pub struct MeasurementKey {
    signal_id: Uuid,
    source: String,
    id: u32,
}

impl MeasurementKey {
    /// Creates a new key. Fails when the signal id is nil or the source
    /// is blank.
    pub fn new(signal_id: Uuid, source: impl Into<String>, id: u32) -> Result<Self> {
        let source = source.into();

        if signal_id.is_nil() {
            return Err(Error::config("measurement key requires a signal id"));
        }

        if source.trim().is_empty() {
            return Err(Error::config("measurement key requires a source"));
        }

        Ok(MeasurementKey {
            signal_id,
            source,
            id,
        })
    }

    /// Returns the globally unique signal id
    pub fn signal_id(&self) -> Uuid {
        self.signal_id
    }

    /// Returns the source identifier
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the source-scoped numeric id
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl PartialEq for MeasurementKey {
    fn eq(&self, other: &Self) -> bool {
        self.signal_id == other.signal_id
    }
}

impl Hash for MeasurementKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signal_id.hash(state);
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [{}]", self.source, self.id, self.signal_id)
    }
}

/// A single timestamped sample decoded from the measurement stream
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Source-scoped numeric id
    pub id: u32,
    /// Source identifier
    pub source: String,
    /// Globally unique signal id
    pub signal_id: Uuid,
    /// Human-readable tag, assignable by the consumer
    pub tag: String,
    /// Raw value
    pub value: f64,
    /// Additive adjustment factor
    pub adder: f64,
    /// Multiplicative adjustment factor
    pub multiplier: f64,
    /// Timestamp in 100 ns ticks
    pub timestamp: Ticks,
    /// Quality flags, see [`state_flags`]
    pub flags: u32,
}

impl Measurement {
    /// Creates a measurement for the given key with default adjustment
    /// factors
    pub fn new(key: &MeasurementKey, value: f64, timestamp: Ticks, flags: u32) -> Self {
        Measurement {
            id: key.id(),
            source: key.source().to_string(),
            signal_id: key.signal_id(),
            tag: String::new(),
            value,
            adder: 0.0,
            multiplier: 1.0,
            timestamp,
            flags,
        }
    }

    /// Returns `value * multiplier + adder`
    pub fn adjusted_value(&self) -> f64 {
        self.value * self.multiplier + self.adder
    }
}

/// Opaque metadata document received from the publisher: compressed bytes
/// or decompressed XML text, never both.
#[derive(Debug, Clone)]
pub enum Metadata {
    /// GZIP-compressed document, delivered when inflation was not negotiated
    /// or failed
    Compressed(Vec<u8>),
    /// Decompressed XML text
    Xml(String),
}

/// Caller-supplied subscription parameters.
///
/// An immutable snapshot of the filter and channel options; the connector
/// retains the last instance for verbatim replay after a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Filter expression selecting the measurement set
    pub filter_expression: String,
    /// Request the compact measurement wire format
    pub compact_format: bool,
    /// Include per-measurement timestamps in the stream
    pub include_time: bool,
    /// Encode timestamps at millisecond rather than tick resolution
    pub use_millisecond_resolution: bool,
    /// Down-sampling interval in milliseconds, -1 for full resolution
    pub processing_interval: i32,
    /// Throttle publication to the processing interval
    pub throttled: bool,
    /// Temporal replay start constraint, None for real-time
    pub start_time_constraint: Option<String>,
    /// Temporal replay stop constraint
    pub stop_time_constraint: Option<String>,
    /// Additional key=value parameters appended to the connection string
    pub extra_connection_parameters: Option<String>,
}

impl Default for SubscriptionInfo {
    fn default() -> Self {
        SubscriptionInfo {
            filter_expression: String::new(),
            compact_format: true,
            include_time: true,
            use_millisecond_resolution: false,
            processing_interval: -1,
            throttled: false,
            start_time_constraint: None,
            stop_time_constraint: None,
            extra_connection_parameters: None,
        }
    }
}

impl SubscriptionInfo {
    /// Creates a real-time subscription for the given filter expression
    pub fn new(filter_expression: impl Into<String>) -> Self {
        SubscriptionInfo {
            filter_expression: filter_expression.into(),
            ..Default::default()
        }
    }

    /// Returns true when the subscription replays a historical range
    pub fn is_temporal(&self) -> bool {
        self.start_time_constraint.is_some()
    }

    /// Builds the key=value connection string sent with the subscribe
    /// command
    pub fn to_connection_string(&self) -> String {
        let mut parts = vec![
            format!("throttled={}", self.throttled),
            format!("includeTime={}", self.include_time),
            format!(
                "useMillisecondResolution={}",
                self.use_millisecond_resolution
            ),
            format!("processingInterval={}", self.processing_interval),
        ];

        if let Some(start) = &self.start_time_constraint {
            parts.push(format!("startTimeConstraint={}", start));
        }

        if let Some(stop) = &self.stop_time_constraint {
            parts.push(format!("stopTimeConstraint={}", stop));
        }

        if let Some(extra) = &self.extra_connection_parameters {
            parts.push(extra.clone());
        }

        parts.push(format!("filterExpression={{{}}}", self.filter_expression));
        parts.join(";")
    }
}
