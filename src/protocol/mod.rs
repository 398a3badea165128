//! Wire protocol implementation
//!
//! This module defines the command and response frame formats, the compact
//! measurement codec with its signal index cache compaction scheme, and the
//! cipher key management for encrypted data packets.

pub mod cache;
pub mod cipher;
pub mod codec;
pub mod message;

pub use self::cache::SignalIndexCache;
pub use self::cipher::{CipherKeySet, CipherManager, KeyIv, SymmetricCipher};
pub use self::codec::{
    decode_data_packet, decode_packet_body, encode_data_packet, BaseTimes, CommandCodec,
    CommandFrame, DataPacket, DecodeContext, EncodeContext, ResponseCodec, ResponseFrame,
    MAX_PAYLOAD_SIZE,
};
pub use self::message::{
    compact_flags, data_packet_flags, mode_bits, CompressionMode, OperationalEncoding,
    OperationalModes, ServerCommand, ServerResponse,
};

/// Length of the random salt prepended to the authentication identifier
pub const CIPHER_SALT_LENGTH: usize = 8;
