//! Error types for gatewire services

use std::fmt;

/// Result type alias using GatewireError
pub type Result<T> = std::result::Result<T, GatewireError>;

/// Low-level decoding failure raised by [`crate::ByteCursor`].
///
/// Both the wire protocol and the container format decode from byte slices,
/// so running off the end of a buffer is reported the same way everywhere.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes remain than the read requires
    #[error("unexpected end of data at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    /// A variable-length integer ran past 10 bytes
    #[error("variable-length integer at offset {0} is too long")]
    VarintOverflow(usize),

    /// A length prefix was negative
    #[error("negative length {length} at offset {offset}")]
    NegativeLength { offset: usize, length: i64 },

    /// A length-encoded integer used a reserved prefix byte
    #[error("invalid length-encoded integer prefix 0x{prefix:02x} at offset {offset}")]
    InvalidLenenc { offset: usize, prefix: u8 },

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),
}

/// Main error type for gatewire services
#[derive(Debug, thiserror::Error)]
pub enum GatewireError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid request/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Decoding error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Backend unavailable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewireError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        GatewireError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            GatewireError::ConfigError(_) => "CONFIG_ERROR",
            GatewireError::InvalidArgument(_) => "INVALID_ARGUMENT",
            GatewireError::Decode(_) => "DECODE_ERROR",
            GatewireError::Io(_) => "IO_ERROR",
            GatewireError::SerializationError(_) => "SERIALIZATION_ERROR",
            GatewireError::ServiceUnavailable(_) => "UNAVAILABLE",
            GatewireError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<serde_json::Error> for GatewireError {
    fn from(err: serde_json::Error) -> Self {
        GatewireError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for GatewireError {
    fn from(err: config::ConfigError) -> Self {
        GatewireError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            GatewireError::ConfigError("missing backends".into()).code(),
            "CONFIG_ERROR"
        );
        let err: GatewireError = DecodeError::VarintOverflow(3).into();
        assert_eq!(err.code(), "DECODE_ERROR");
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::UnexpectedEnd {
            offset: 4,
            needed: 2,
            remaining: 1,
        };
        assert_eq!(
            err.to_string(),
            "unexpected end of data at offset 4: needed 2 bytes, 1 remaining"
        );
    }
}
