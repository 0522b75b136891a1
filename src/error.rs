//! # Error Types
//!
//! Error handling for the protocol core.
//!
//! Every failure in the codec pipeline surfaces as a [`ProtocolError`] value
//! before a connection transitions to `Closed`; nothing is swallowed.
//!
//! ## Error Categories
//! - **Framing**: oversized frames, malformed escapes
//! - **Cipher**: decrypted structure failing sanity checks
//! - **Compression**: unknown markers, decompression failures
//! - **Field decode**: invalid digits, truncated values, overflow
//! - **Session**: handshake failures, closed connections, backpressure
//!
//! Structural errors are unrecoverable for a connection because the byte
//! stream cannot be realigned. Use [`ProtocolError::is_fatal`] to tell them
//! apart from the tolerated ones.
//!
//! ## Example Usage
//! ```rust
//! use reborn_protocol::core::field::decode_var_int;
//! use reborn_protocol::error::ProtocolError;
//!
//! // A digit count of 1 followed by a byte below the +32 offset.
//! let result = decode_var_int(&[33, 0x05], 0);
//! assert!(matches!(result, Err(ProtocolError::MalformedField { .. })));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_EMPTY_FRAME: &str = "Frame carries no compression marker";
    pub const ERR_DANGLING_ESCAPE: &str = "Escape byte at end of frame";
    pub const ERR_INVALID_ESCAPE: &str = "Invalid escape sequence in frame";

    /// Cipher sanity errors
    pub const ERR_EMPTY_PLAINTEXT: &str = "Decrypted payload is empty";
    pub const ERR_MISSING_TERMINATOR: &str = "Decrypted payload lacks packet terminator";
    pub const ERR_TERMINATOR_IN_PACKET: &str = "Legacy packet contains the 0x0a terminator";

    /// Field decode errors
    pub const ERR_TRUNCATED_VALUE: &str = "Buffer exhausted mid-value";
    pub const ERR_DIGIT_RANGE: &str = "Digit byte outside the valid range";
    pub const ERR_DIGIT_COUNT: &str = "Invalid variable-length integer digit count";
    pub const ERR_NON_CANONICAL: &str = "Non-canonical variable-length integer";
    pub const ERR_OVERFLOW: &str = "Variable-length integer overflows 64 bits";
    pub const ERR_RAW_TAIL_POSITION: &str = "Raw tail must be the last field";

    /// Handshake errors
    pub const ERR_HANDSHAKE_TRUNCATED: &str = "Handshake shorter than its fixed fields";
    pub const ERR_HANDSHAKE_PEER_CLOSED: &str = "Peer closed the connection during handshake";
    pub const ERR_CLIENT_TYPE_RANGE: &str = "Client type does not fit in a single offset digit";
    pub const ERR_SEED_RANGE: &str = "Cipher seed does not fit in a single offset digit";
    pub const ERR_VERSION_TOKEN: &str = "Protocol version token must be 8 ASCII bytes";
    pub const ERR_ENCRYPTION_REQUIRED: &str = "Peer requested an unencrypted session";

    /// Dispatch errors
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_DUPLICATE_PACKET_ID: &str = "Packet id registered twice";
    pub const ERR_DUPLICATE_HANDLER: &str = "Handler already registered";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {size} bytes (maximum {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Cipher desynchronized: {0}")]
    CipherDesync(&'static str),

    #[error("Invalid compression marker: 0x{0:02x}")]
    InvalidCompressionMarker(u8),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Malformed field at byte {offset}: {reason}")]
    MalformedField { offset: usize, reason: &'static str },

    #[error("Field value {value} does not fit in {field}")]
    FieldOutOfRange { field: &'static str, value: u64 },

    #[error("Unknown packet id: {0}")]
    UnknownPacketId(u8),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full")]
    Backpressure,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Shorthand for a field decode failure at `offset`.
    pub(crate) fn malformed(offset: usize, reason: &'static str) -> Self {
        Self::MalformedField { offset, reason }
    }

    /// Whether the error leaves the byte stream unrecoverable.
    ///
    /// Unknown identifiers and a full outbound queue are tolerated; every
    /// structural failure requires the connection to close.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::UnknownPacketId(_) | ProtocolError::Backpressure
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
