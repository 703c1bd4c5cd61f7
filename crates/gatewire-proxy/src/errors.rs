//! Error classification for client sessions
//!
//! Maps proxy-side failures to the error packets clients receive and sorts
//! session terminations into normal disconnects and real failures for
//! logging.

use gatewire_protocol::constants::ER_UNKNOWN_STMT_HANDLER;
use gatewire_protocol::{is_disconnect_error, messages, Packet, ProtocolError};
use std::fmt;
use std::io;

/// Error codes the proxy generates itself
pub mod codes {
    /// No backend could be reached
    pub const ER_CONNECT_FAILED: u16 = 2003;
    /// A packet could not be parsed
    pub const ER_MALFORMED_PACKET: u16 = 1835;
    /// Generic proxy-side failure
    pub const ER_INTERNAL: u16 = 1105;

    pub const GENERAL_SQL_STATE: &str = "HY000";
}

/// Error category for logging and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A peer closed or reset its connection
    Disconnect,
    /// No backend accepted the connection
    Unavailable,
    /// The client or backend sent something the protocol state did not allow
    Protocol,
    /// Client referenced an unknown prepared statement
    NotFound,
    /// Other socket failures
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Disconnect => write!(f, "disconnect"),
            ErrorCategory::Unavailable => write!(f, "unavailable"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// An error with everything needed to answer the client
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub code: u16,
    pub sql_state: &'static str,
    pub category: ErrorCategory,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(code: u16, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: codes::GENERAL_SQL_STATE,
            category,
            message: message.into(),
        }
    }

    /// ERR packet answering a command that carried `command_sequence`
    pub fn to_packet(&self, command_sequence: u8) -> Packet {
        messages::err_packet(
            command_sequence.wrapping_add(1),
            self.code,
            self.sql_state,
            &self.message,
        )
    }
}

/// Classify an error raised while forwarding a client command
pub fn classify_protocol_error(err: &ProtocolError) -> ClassifiedError {
    match err {
        ProtocolError::UnknownStatement(id) => ClassifiedError::new(
            ER_UNKNOWN_STMT_HANDLER,
            ErrorCategory::NotFound,
            format!("Unknown prepared statement handler ({}) given to mysqld_stmt_execute", id),
        ),
        ProtocolError::Malformed(e) => ClassifiedError::new(
            codes::ER_MALFORMED_PACKET,
            ErrorCategory::Protocol,
            format!("Malformed communication packet: {}", e),
        ),
        ProtocolError::ShortPacket(_) => ClassifiedError::new(
            codes::ER_MALFORMED_PACKET,
            ErrorCategory::Protocol,
            "Malformed communication packet",
        ),
        ProtocolError::UnexpectedPacket { .. } | ProtocolError::FetchUnderflow { .. } => {
            ClassifiedError::new(codes::ER_INTERNAL, ErrorCategory::Protocol, err.to_string())
        }
        ProtocolError::Io(e) => classify_io_error(e),
    }
}

pub fn classify_io_error(err: &io::Error) -> ClassifiedError {
    let category = if is_normal_disconnect(err) {
        ErrorCategory::Disconnect
    } else {
        ErrorCategory::Io
    };
    ClassifiedError::new(codes::ER_INTERNAL, category, err.to_string())
}

/// Error sent when no backend accepts the connection
pub fn backend_unavailable(detail: &str) -> ClassifiedError {
    ClassifiedError::new(
        codes::ER_CONNECT_FAILED,
        ErrorCategory::Unavailable,
        format!("No backend server available: {}", detail),
    )
}

/// Peer went away; not worth an error log line
pub fn is_normal_disconnect(err: &io::Error) -> bool {
    is_disconnect_error(err) || err.kind() == io::ErrorKind::UnexpectedEof
}

/// Whether a session error should be logged at debug rather than error level
pub fn is_quiet_session_end(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(is_normal_disconnect)
            || matches!(
                cause.downcast_ref::<ProtocolError>(),
                Some(ProtocolError::Io(e)) if is_normal_disconnect(e)
            )
    })
}
