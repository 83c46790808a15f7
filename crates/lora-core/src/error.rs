//! Error types for the LoRaWAN ingestion agent
//!
//! One variant per failure class the ingestion path distinguishes. Payload
//! decoding has its own [`DecodeError`] so codec callers can match on the
//! exact structural violation.

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the ingestion agent
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid provider/application configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound topic or message body
    #[error("Parse error on topic {topic}: {message}")]
    Parse {
        /// Topic the message arrived on
        topic: String,
        /// What was wrong with it
        message: String,
    },

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Broker connection or subscription failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device-management collaborator already knows this device id
    #[error("Duplicate device: {0}")]
    DuplicateDevice(String),

    /// Device, configuration or application not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The update sink rejected an attribute update
    #[error("Update sink error: {0}")]
    Sink(String),

    /// An out-of-line round-trip did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error for a topic
    pub fn parse(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a duplicate device error
    pub fn duplicate_device(id: impl Into<String>) -> Self {
        Self::DuplicateDevice(id.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an update sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for [`Error::Timeout`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// True for [`Error::DuplicateDevice`]
    pub fn is_duplicate_device(&self) -> bool {
        matches!(self, Self::DuplicateDevice(_))
    }
}

/// Structural payload decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Tagged-binary payload below the minimum record size
    #[error("payload too short: {len} bytes (minimum {min})")]
    TooShort { len: usize, min: usize },

    /// A record's value runs past the end of the buffer
    #[error("truncated record for channel {channel} type {type_id} at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        channel: u8,
        type_id: u8,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Record type id outside the supported set
    #[error("unsupported type {type_id} on channel {channel}")]
    UnsupportedType { channel: u8, type_id: u8 },

    /// Payload is not valid base64
    #[error("invalid base64: {0}")]
    Base64(String),

    /// Payload is not valid CBOR
    #[error("invalid CBOR: {0}")]
    Cbor(String),

    /// Decoded value is not a key/value mapping
    #[error("decoded payload is not a mapping: {0}")]
    NotAMapping(String),
}
