use crate::core::{Error, Result, PROTOCOL_VERSION};

/// Commands sent from the subscriber to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerCommand {
    /// Authenticate with a salted, encrypted identifier
    Authenticate = 0x00,
    /// Request the latest metadata document
    MetadataRefresh = 0x01,
    /// Start or replace a subscription
    Subscribe = 0x02,
    /// Stop the active subscription
    Unsubscribe = 0x03,
    /// Request new cipher keys for data packet encryption
    RotateCipherKeys = 0x04,
    /// Change the temporal processing interval
    UpdateProcessingInterval = 0x05,
    /// Negotiate operational modes; must be the first command sent
    DefineOperationalModes = 0x06,
}

impl TryFrom<u8> for ServerCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ServerCommand::Authenticate),
            0x01 => Ok(ServerCommand::MetadataRefresh),
            0x02 => Ok(ServerCommand::Subscribe),
            0x03 => Ok(ServerCommand::Unsubscribe),
            0x04 => Ok(ServerCommand::RotateCipherKeys),
            0x05 => Ok(ServerCommand::UpdateProcessingInterval),
            0x06 => Ok(ServerCommand::DefineOperationalModes),
            _ => Err(Error::framing(format!("unknown command code 0x{value:02X}"))),
        }
    }
}

/// Responses sent from the publisher to the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerResponse {
    /// Solicited command succeeded
    Succeeded = 0x80,
    /// Solicited command failed
    Failed = 0x81,
    /// Measurement data packet
    DataPacket = 0x82,
    /// Wholesale replacement of the signal index cache
    UpdateSignalIndexCache = 0x83,
    /// Replacement of the base time offsets
    UpdateBaseTimes = 0x84,
    /// New cipher key material
    UpdateCipherKeys = 0x85,
    /// Timestamp of the first measurement to follow
    DataStartTime = 0x86,
    /// Temporal replay finished
    ProcessingComplete = 0x87,
    /// Keep-alive
    NoOp = 0xFF,
}

impl TryFrom<u8> for ServerResponse {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(ServerResponse::Succeeded),
            0x81 => Ok(ServerResponse::Failed),
            0x82 => Ok(ServerResponse::DataPacket),
            0x83 => Ok(ServerResponse::UpdateSignalIndexCache),
            0x84 => Ok(ServerResponse::UpdateBaseTimes),
            0x85 => Ok(ServerResponse::UpdateCipherKeys),
            0x86 => Ok(ServerResponse::DataStartTime),
            0x87 => Ok(ServerResponse::ProcessingComplete),
            0xFF => Ok(ServerResponse::NoOp),
            _ => Err(Error::framing(format!(
                "unknown response code 0x{value:02X}"
            ))),
        }
    }
}

/// Data packet header flags
pub mod data_packet_flags {
    /// Packet carries a frame-level timestamp
    pub const SYNCHRONIZED: u8 = 0x01;
    /// Measurements use the compact wire format
    pub const COMPACT: u8 = 0x02;
    /// Use the odd cipher index when decrypting, even when clear
    pub const CIPHER_INDEX: u8 = 0x04;
}

/// Compact measurement record flags
pub mod compact_flags {
    /// A data range flag was set
    pub const DATA_RANGE: u8 = 0x01;
    /// A data quality flag was set
    pub const DATA_QUALITY: u8 = 0x02;
    /// A time quality flag was set
    pub const TIME_QUALITY: u8 = 0x04;
    /// A system issue flag was set
    pub const SYSTEM_ISSUE: u8 = 0x08;
    /// Calculated value bit
    pub const CALCULATED_VALUE: u8 = 0x10;
    /// Discarded value bit
    pub const DISCARDED_VALUE: u8 = 0x20;
    /// Timestamp was encoded as an offset against a base time
    pub const BASE_TIME_OFFSET: u8 = 0x40;
    /// Use the odd time index when set, even when clear
    pub const TIME_INDEX: u8 = 0x80;

    /// Mask of the quality bits shared with the 32-bit state word
    pub const QUALITY_MASK: u8 = 0x3F;
}

/// Bit layout of the 32-bit operational mode word
pub mod mode_bits {
    /// Bits 0-4: protocol version
    pub const VERSION_MASK: u32 = 0x0000_001F;
    /// Bits 5-7: compression mode
    pub const COMPRESSION_MODE_MASK: u32 = 0x0000_00E0;
    /// Bits 8-9: text encoding
    pub const ENCODING_MASK: u32 = 0x0000_0300;
    /// Bit 24: common cross-implementation serialization format
    pub const USE_COMMON_SERIALIZATION_FORMAT: u32 = 0x0100_0000;
    /// Bit 30: compress signal index cache payloads
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    /// Bit 31: compress metadata payloads
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;
}

/// Compression mode negotiated in the operational mode word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum CompressionMode {
    /// No compression
    #[default]
    None = 0x00,
    /// GZIP compression
    Gzip = 0x20,
}

/// Text encoding negotiated for string payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum OperationalEncoding {
    /// UTF-16 little endian
    Unicode = 0x000,
    /// UTF-16 big endian
    BigEndianUnicode = 0x100,
    /// UTF-8
    #[default]
    Utf8 = 0x200,
    /// Operating system default; treated as UTF-8 here
    OperatingSystemDefault = 0x300,
}

impl OperationalEncoding {
    /// Encodes a string into the negotiated representation
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            OperationalEncoding::Utf8 | OperationalEncoding::OperatingSystemDefault => {
                text.as_bytes().to_vec()
            }
            OperationalEncoding::Unicode => text
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
            OperationalEncoding::BigEndianUnicode => text
                .encode_utf16()
                .flat_map(|unit| unit.to_be_bytes())
                .collect(),
        }
    }

    /// Decodes bytes in the negotiated representation
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            OperationalEncoding::Utf8 | OperationalEncoding::OperatingSystemDefault => {
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::framing(format!("invalid UTF-8 payload: {}", e)))
            }
            OperationalEncoding::Unicode | OperationalEncoding::BigEndianUnicode => {
                if bytes.len() % 2 != 0 {
                    return Err(Error::framing("odd-length UTF-16 payload"));
                }

                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| match self {
                        OperationalEncoding::BigEndianUnicode => {
                            u16::from_be_bytes([pair[0], pair[1]])
                        }
                        _ => u16::from_le_bytes([pair[0], pair[1]]),
                    })
                    .collect();

                String::from_utf16(&units)
                    .map_err(|e| Error::framing(format!("invalid UTF-16 payload: {}", e)))
            }
        }
    }
}

/// Operational modes requested from the publisher before any other command.
///
/// The mode word is validated locally before it is sent: the common
/// serialization format bit is mandatory for this implementation, and
/// signal-index-cache compression is rejected because it is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationalModes {
    /// Protocol version, bits 0-4
    pub version: u8,
    /// Payload compression mode
    pub compression: CompressionMode,
    /// Text encoding for string payloads
    pub encoding: OperationalEncoding,
    /// Request GZIP-compressed metadata documents
    pub compress_metadata: bool,
    /// Request GZIP-compressed signal index cache payloads (unsupported)
    pub compress_signal_index_cache: bool,
    /// Use the common cross-implementation serialization format
    pub use_common_serialization_format: bool,
}

impl Default for OperationalModes {
    fn default() -> Self {
        OperationalModes {
            version: PROTOCOL_VERSION,
            compression: CompressionMode::None,
            encoding: OperationalEncoding::Utf8,
            compress_metadata: false,
            compress_signal_index_cache: false,
            use_common_serialization_format: true,
        }
    }
}

impl OperationalModes {
    /// Builds the 32-bit mode word, rejecting unsupported combinations
    pub fn to_word(self) -> Result<u32> {
        if !self.use_common_serialization_format {
            return Err(Error::config(
                "only the common serialization format is supported",
            ));
        }

        if self.compress_signal_index_cache {
            return Err(Error::config(
                "signal index cache compression is not implemented",
            ));
        }

        if self.version as u32 & !mode_bits::VERSION_MASK != 0 {
            return Err(Error::config("protocol version exceeds 5 bits"));
        }

        let mut word = self.version as u32;
        word |= self.compression as u32;
        word |= self.encoding as u32;
        word |= mode_bits::USE_COMMON_SERIALIZATION_FORMAT;

        if self.compress_metadata {
            word |= mode_bits::COMPRESS_METADATA;

            if self.compression != CompressionMode::Gzip {
                return Err(Error::config(
                    "compressed metadata requires the GZIP compression mode",
                ));
            }
        }

        Ok(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        for code in 0x00u8..=0x06 {
            let command = ServerCommand::try_from(code).unwrap();
            assert_eq!(command as u8, code);
        }
        assert!(ServerCommand::try_from(0x07).is_err());
    }

    #[test]
    fn test_response_round_trip() {
        for code in (0x80u8..=0x87).chain(std::iter::once(0xFF)) {
            let response = ServerResponse::try_from(code).unwrap();
            assert_eq!(response as u8, code);
        }
        assert!(ServerResponse::try_from(0x88).is_err());
        assert!(ServerResponse::try_from(0x00).is_err());
    }

    #[test]
    fn test_mode_word_layout() {
        let modes = OperationalModes {
            compression: CompressionMode::Gzip,
            compress_metadata: true,
            ..Default::default()
        };
        let word = modes.to_word().unwrap();

        assert_eq!(word & mode_bits::VERSION_MASK, PROTOCOL_VERSION as u32);
        assert_eq!(word & mode_bits::COMPRESSION_MODE_MASK, 0x20);
        assert_eq!(word & mode_bits::ENCODING_MASK, 0x200);
        assert_ne!(word & mode_bits::USE_COMMON_SERIALIZATION_FORMAT, 0);
        assert_ne!(word & mode_bits::COMPRESS_METADATA, 0);
        assert_eq!(word & mode_bits::COMPRESS_SIGNAL_INDEX_CACHE, 0);
    }

    #[test]
    fn test_mode_word_rejects_alternate_serialization() {
        let modes = OperationalModes {
            use_common_serialization_format: false,
            ..Default::default()
        };
        assert!(matches!(modes.to_word(), Err(Error::Config(_))));
    }

    #[test]
    fn test_mode_word_rejects_cache_compression() {
        let modes = OperationalModes {
            compress_signal_index_cache: true,
            ..Default::default()
        };
        assert!(matches!(modes.to_word(), Err(Error::Config(_))));
    }

    #[test]
    fn test_encoding_round_trip() {
        let text = "FILTER ActiveMeasurements WHERE SignalType='FREQ'";

        for encoding in [
            OperationalEncoding::Utf8,
            OperationalEncoding::Unicode,
            OperationalEncoding::BigEndianUnicode,
        ] {
            let bytes = encoding.encode(text);
            assert_eq!(encoding.decode(&bytes).unwrap(), text);
        }
    }

    #[test]
    fn test_utf16_rejects_odd_length() {
        assert!(OperationalEncoding::Unicode.decode(&[0x41]).is_err());
    }
}
