//! Codec error types.

use thiserror::Error;

/// Errors raised while framing or parsing OpenFlow messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported OpenFlow version 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("invalid message length {0}")]
    BadLength(usize),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("message type {0} cannot be encoded")]
    NotEncodable(&'static str),

    #[error("encoded message exceeds 65535 bytes ({0})")]
    TooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
