use std::io;
use thiserror::Error;

/// Custom error types for the subscriber transport
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or short frame. Recoverable: the frame is skipped and an
    /// error event is raised.
    #[error("Framing error: {0}")]
    Framing(String),

    /// A compact measurement referenced a signal index that is not present
    /// in the current signal index cache generation. Recoverable per record.
    #[error("Unknown signal index: {0}")]
    UnknownSignalIndex(u16),

    /// Missing key material or decrypt failure. Fatal to the channel.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The publisher answered a mode negotiation or authenticate command
    /// with a failure code. The connection stays open for the caller.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Socket EOF or error. Fatal to the subscriber session.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }

    /// Creates a new crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Creates a new handshake rejection error
    pub fn handshake_rejected(msg: impl Into<String>) -> Self {
        Error::HandshakeRejected(msg.into())
    }

    /// Creates a new channel closed error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Error::ChannelClosed(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true when the error terminates the owning channel rather
    /// than a single frame or record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Crypto(_) | Error::ChannelClosed(_)
        )
    }
}
