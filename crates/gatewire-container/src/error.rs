//! Error types for container file reading and writing

use gatewire_common::DecodeError;
use std::fmt;

/// Result type alias using ContainerError
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Length of the per-file sync marker
pub const SYNC_MARKER_LEN: usize = 16;

/// How a sync marker check failed.
///
/// The distinction is a heuristic: a block that was read from the expected
/// offset but is corrupted upstream is still reported as `MarkerDiffers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMismatchKind {
    /// The file position after the block is not where the block header said
    /// it would be
    WrongOffset,
    /// The position is right but the marker bytes differ
    MarkerDiffers,
}

impl SyncMismatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMismatchKind::WrongOffset => "wrong_offset",
            SyncMismatchKind::MarkerDiffers => "marker_differs",
        }
    }
}

impl fmt::Display for SyncMismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while reading or writing container files
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a container file: magic bytes {0:02x?}")]
    BadMagic(Vec<u8>),

    #[error("file header does not contain a schema")]
    MissingSchema,

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error(
        "sync marker mismatch ({kind}): expected position {expected_pos}, actual position {actual_pos}, \
         expected marker {expected:02x?}, actual marker {actual:02x?}"
    )]
    SyncMismatch {
        kind: SyncMismatchKind,
        expected_pos: u64,
        actual_pos: u64,
        expected: [u8; SYNC_MARKER_LEN],
        actual: [u8; SYNC_MARKER_LEN],
    },

    #[error("truncated block at offset {offset}: needed {needed} bytes, {available} available")]
    TruncatedBlock {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// Declared record counts add up past what a record index can hold
    #[error("record count of block at offset {offset} overflows the record index")]
    RecordCountOverflow { offset: u64 },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("field '{field}' has a type that cannot be decoded")]
    UnsupportedType { field: String },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Error category kept as a reader's sticky last error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerErrorKind {
    Io,
    BadMagic,
    MissingSchema,
    SchemaParse,
    SyncMismatch,
    TruncatedBlock,
    RecordCountOverflow,
    Decompression,
    UnsupportedCodec,
    UnsupportedType,
    InvalidValue,
    Decode,
}

impl ContainerError {
    pub fn kind(&self) -> ContainerErrorKind {
        match self {
            ContainerError::Io(_) => ContainerErrorKind::Io,
            ContainerError::BadMagic(_) => ContainerErrorKind::BadMagic,
            ContainerError::MissingSchema => ContainerErrorKind::MissingSchema,
            ContainerError::SchemaParse(_) => ContainerErrorKind::SchemaParse,
            ContainerError::SyncMismatch { .. } => ContainerErrorKind::SyncMismatch,
            ContainerError::TruncatedBlock { .. } => ContainerErrorKind::TruncatedBlock,
            ContainerError::RecordCountOverflow { .. } => ContainerErrorKind::RecordCountOverflow,
            ContainerError::Decompression(_) => ContainerErrorKind::Decompression,
            ContainerError::UnsupportedCodec(_) => ContainerErrorKind::UnsupportedCodec,
            ContainerError::UnsupportedType { .. } => ContainerErrorKind::UnsupportedType,
            ContainerError::InvalidValue { .. } => ContainerErrorKind::InvalidValue,
            ContainerError::Decode(_) => ContainerErrorKind::Decode,
        }
    }

    /// Corruption and decode failures; the file or block cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ContainerError::BadMagic(_)
                | ContainerError::MissingSchema
                | ContainerError::SyncMismatch { .. }
                | ContainerError::TruncatedBlock { .. }
                | ContainerError::RecordCountOverflow { .. }
                | ContainerError::Decompression(_)
                | ContainerError::Decode(_)
        )
    }

    pub(crate) fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        ContainerError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ContainerError {
    fn from(err: serde_json::Error) -> Self {
        ContainerError::SchemaParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ContainerError::MissingSchema.kind(), ContainerErrorKind::MissingSchema);
        assert!(ContainerError::MissingSchema.is_corruption());
        assert!(!ContainerError::UnsupportedCodec("snappy".into()).is_corruption());
    }

    #[test]
    fn test_sync_mismatch_message() {
        let err = ContainerError::SyncMismatch {
            kind: SyncMismatchKind::WrongOffset,
            expected_pos: 100,
            actual_pos: 96,
            expected: [0xAB; SYNC_MARKER_LEN],
            actual: [0; SYNC_MARKER_LEN],
        };
        let msg = err.to_string();
        assert!(msg.contains("wrong_offset"));
        assert!(msg.contains("expected position 100"));
        assert!(msg.contains("actual position 96"));
    }
}
