//! Error types for the backend protocol core

use crate::reply::ReplyState;
use gatewire_common::DecodeError;

/// Result type alias using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while tracking or rewriting backend traffic
///
/// Protocol-state errors are reported to the owning connection, which decides
/// whether to disconnect. None of them leave the state machine in an
/// undefined state.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A packet arrived that the current reply state cannot accept
    #[error("unexpected packet in state {state}: command 0x{command:02x}, length {len}")]
    UnexpectedPacket {
        state: ReplyState,
        command: u8,
        len: usize,
    },

    /// More fetch rows arrived than the fetch command asked for
    #[error("received more rows than the {requested} requested by COM_STMT_FETCH")]
    FetchUnderflow { requested: u32 },

    /// The client referenced a statement id this backend never prepared
    #[error("unknown prepared statement id {0}")]
    UnknownStatement(u32),

    /// A packet was too short or otherwise malformed
    #[error("malformed packet: {0}")]
    Malformed(#[from] DecodeError),

    /// A client packet did not carry a complete header
    #[error("packet of {0} bytes is shorter than the packet header")]
    ShortPacket(usize),

    /// Socket-level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::UnexpectedPacket { .. } => "unexpected_packet",
            ProtocolError::FetchUnderflow { .. } => "fetch_underflow",
            ProtocolError::UnknownStatement(_) => "unknown_statement",
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::ShortPacket(_) => "short_packet",
            ProtocolError::Io(_) => "io",
        }
    }

    /// Whether the connection cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::Malformed(_))
    }
}
