//! Error types for the DT-Messaging engine
//!
//! One enum per concern, unified under [`EngineError`]. Network-layer
//! failures are never surfaced to callers as panics; they become status
//! transitions and engine events, so most variants here are reported through
//! logs or dropped packets rather than bubbled to the UI.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Cryptographic Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key provider failed to initialize; egress falls back to plaintext.
    #[error("crypto provider unavailable")]
    Unavailable,
    /// Payload structure could not be parsed (base64, IV length, UTF-8).
    #[error("malformed encrypted payload: {0}")]
    BadFormat(String),
    /// Integrity tag mismatch or padding failure after decryption.
    #[error("message failed integrity verification")]
    Tampered,
}

// ----------------------------------------------------------------------------
// Codec Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode network message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode network message: {0}")]
    Decode(#[source] serde_json::Error),
    /// A required wire field was absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp on wire message")]
    InvalidTimestamp,
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("send to endpoint {endpoint} failed: {reason}")]
    SendFailed { endpoint: String, reason: String },
    #[error("transport is shut down")]
    Shutdown,
}

// ----------------------------------------------------------------------------
// Validation Errors
// ----------------------------------------------------------------------------

/// The only errors surfaced directly to callers of the send API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content is {len} code points (maximum {max})")]
    ContentTooLong { len: usize, max: usize },
}

// ----------------------------------------------------------------------------
// Engine Error
// ----------------------------------------------------------------------------

/// Top-level error type for the DT-Messaging engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No connected peers; non-fatal, triggers a retry.
    #[error("no connected peers")]
    NoPeers,

    /// Message TTL elapsed.
    #[error("message expired")]
    Expired,

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Persistent store failure, reported by message rather than typed
    /// source so the protocol crate stays free of the storage dependency.
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// Internal channel closed, normally only during shutdown.
    #[error("channel error: {message}")]
    Channel { message: String },
}

impl EngineError {
    pub fn persistence<T: Into<String>>(message: T) -> Self {
        EngineError::Persistence {
            message: message.into(),
        }
    }

    pub fn channel<T: Into<String>>(message: T) -> Self {
        EngineError::Channel {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, EngineError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
