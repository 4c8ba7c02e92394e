//! Error types for the wire layer.

use thiserror::Error;

/// Errors produced while framing, classifying, or assembling messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame opened like a start tag but could not be parsed as one.
    /// These are dropped by the relay, never treated as content.
    #[error("malformed open tag: {0}")]
    MalformedTag(String),

    /// A frame exceeded the transport size cap.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame payload was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Append to a content buffer that has already been closed.
    #[error("content buffer already closed")]
    ClobClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
