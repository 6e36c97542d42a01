//! Error types for the CATS protocol engine.

use thiserror::Error;

/// Main error type for all CATS operations.
///
/// Errors split into two severity classes: *fatal* errors kill the
/// connection (framing violations, handshake rejection, transport I/O),
/// while *exchange-scoped* errors fail a single request/input exchange and
/// leave the connection running. See [`CatsError::is_fatal`].
#[derive(Debug, Error)]
pub enum CatsError {
    /// Underlying transport I/O failure. Fatal.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing, unknown action tag, out-of-range message id,
    /// input reply without a pending waiter. Fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake rejected or timed out. Fatal.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Headers or payload inside a consumed envelope could not be parsed.
    /// Exchange-scoped: the frame reader has already consumed the blob.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Payload could not be encoded/decoded by the selected codec.
    #[error("codec error: {0}")]
    Codec(String),

    /// Payload could not be compressed/decompressed, or checksums mismatch.
    #[error("compressor error: {0}")]
    Compressor(String),

    /// Scheme-format (JSON/YAML/TOML) serialization failure.
    #[error("scheme error: {0}")]
    Scheme(String),

    /// Handler-level input validation failure. Exchange-scoped; carries the
    /// HTTP-style status the error response should use.
    #[error("validation error ({status}): {message}")]
    Validation { status: u16, message: String },

    /// No handler registered for the given id and api version. Fatal.
    #[error("handler not found for id {0:#06x}")]
    HandlerNotFound(u16),

    /// Nested `ask` depth exceeded the configured limit. Exchange-scoped.
    #[error("input limit exceeded")]
    InputLimitExceeded,

    /// The peer did not answer an input prompt in time. Exchange-scoped.
    #[error("input timed out")]
    InputTimeout,

    /// The peer cancelled an input prompt. Exchange-scoped.
    #[error("input cancelled")]
    InputCancelled,

    /// Any suspended operation on a closed connection resolves with this.
    #[error("connection closed")]
    ConnectionClosed,
}

impl CatsError {
    /// Shorthand for a [`CatsError::Protocol`] with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Shorthand for a handler validation error.
    pub fn validation(status: u16, msg: impl Into<String>) -> Self {
        Self::Validation {
            status,
            message: msg.into(),
        }
    }

    /// Whether this error must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Protocol(_)
                | Self::Handshake(_)
                | Self::HandlerNotFound(_)
                | Self::ConnectionClosed
        )
    }

    /// Short machine-readable name, used in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "TransportError",
            Self::Protocol(_) => "ProtocolError",
            Self::Handshake(_) => "HandshakeError",
            Self::Malformed(_) => "MalformedData",
            Self::Codec(_) => "CodecError",
            Self::Compressor(_) => "CompressorError",
            Self::Scheme(_) => "SchemeError",
            Self::Validation { .. } => "ValidationError",
            Self::HandlerNotFound(_) => "HandlerNotFound",
            Self::InputLimitExceeded => "InputLimitExceeded",
            Self::InputTimeout => "InputTimeout",
            Self::InputCancelled => "InputCancelled",
            Self::ConnectionClosed => "ConnectionClosed",
        }
    }

    /// HTTP-style status used when this error is conveyed as a response.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { status, .. } => *status,
            Self::InputTimeout => 503,
            Self::Malformed(_) | Self::Codec(_) | Self::Compressor(_) | Self::Scheme(_) => 400,
            _ => 500,
        }
    }
}

/// Result type alias using [`CatsError`].
pub type Result<T> = std::result::Result<T, CatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CatsError::protocol("bad tag").is_fatal());
        assert!(CatsError::ConnectionClosed.is_fatal());
        assert!(CatsError::Handshake("rejected".into()).is_fatal());

        assert!(!CatsError::InputCancelled.is_fatal());
        assert!(!CatsError::InputTimeout.is_fatal());
        assert!(!CatsError::validation(400, "bad field").is_fatal());
        assert!(!CatsError::Malformed("no separator".into()).is_fatal());
    }

    #[test]
    fn test_response_status() {
        assert_eq!(CatsError::validation(422, "nope").status(), 422);
        assert_eq!(CatsError::InputTimeout.status(), 503);
        assert_eq!(CatsError::Codec("bad json".into()).status(), 400);
        assert_eq!(CatsError::InputLimitExceeded.status(), 500);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(CatsError::protocol("x").kind(), "ProtocolError");
        assert_eq!(CatsError::validation(400, "x").kind(), "ValidationError");
        assert_eq!(
            CatsError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).kind(),
            "TransportError"
        );
    }
}
