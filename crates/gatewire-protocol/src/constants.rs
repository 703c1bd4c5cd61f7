//! Wire protocol constants
//!
//! Packet layout, reply markers, status flags and command bytes.

/// Length of the packet header: 3-byte payload length + 1-byte sequence
pub const PACKET_HEADER_LEN: usize = 4;

/// Largest payload a single packet can carry. A packet of exactly this
/// length is continued by the next packet.
pub const MAX_PACKET_PAYLOAD: usize = 0xFF_FFFF;

/// Payload length of an EOF packet (marker + warnings + status)
pub const EOF_PAYLOAD_LEN: usize = 5;

/// Reply marker: OK packet
pub const REPLY_OK: u8 = 0x00;

/// Reply marker: local infile request
pub const REPLY_LOCAL_INFILE: u8 = 0xFB;

/// Reply marker: EOF packet (also an 8-byte length-encoded integer prefix in rows)
pub const REPLY_EOF: u8 = 0xFE;

/// Reply marker: ERR packet
pub const REPLY_ERR: u8 = 0xFF;

/// Marker byte that precedes the SQL state in an ERR packet
pub const SQL_STATE_MARKER: u8 = b'#';

/// Length of an SQL state string
pub const SQL_STATE_LEN: usize = 5;

/// Server status: in transaction
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;

/// Server status: autocommit enabled
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// Server status: another result set follows
pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;

/// Server status: a cursor exists for the statement
pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;

/// Server status: last row of a cursor was sent
pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;

/// Offset of the statement id within a prepared-statement command payload
/// (right after the command byte)
pub const PS_ID_OFFSET: usize = 1;

/// Size of a statement id
pub const PS_ID_SIZE: usize = 4;

/// Error code sent to clients that reference an unknown statement
pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;

/// Commands (first payload byte of a client packet)
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_FIELD_LIST: u8 = 0x04;
    pub const COM_STATISTICS: u8 = 0x09;
    pub const COM_PING: u8 = 0x0E;
    pub const COM_STMT_PREPARE: u8 = 0x16;
    pub const COM_STMT_EXECUTE: u8 = 0x17;
    pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
    pub const COM_STMT_CLOSE: u8 = 0x19;
    pub const COM_STMT_RESET: u8 = 0x1A;
    pub const COM_STMT_FETCH: u8 = 0x1C;

    /// Whether the server answers this command at all
    pub fn will_respond(cmd: u8) -> bool {
        cmd != COM_STMT_SEND_LONG_DATA && cmd != COM_QUIT && cmd != COM_STMT_CLOSE
    }

    /// Commands whose payload starts with a statement id
    pub fn references_statement(cmd: u8) -> bool {
        matches!(
            cmd,
            COM_STMT_EXECUTE
                | COM_STMT_SEND_LONG_DATA
                | COM_STMT_CLOSE
                | COM_STMT_RESET
                | COM_STMT_FETCH
        )
    }

    /// Short name for logging
    pub fn name(cmd: u8) -> &'static str {
        match cmd {
            COM_QUIT => "COM_QUIT",
            COM_INIT_DB => "COM_INIT_DB",
            COM_QUERY => "COM_QUERY",
            COM_FIELD_LIST => "COM_FIELD_LIST",
            COM_STATISTICS => "COM_STATISTICS",
            COM_PING => "COM_PING",
            COM_STMT_PREPARE => "COM_STMT_PREPARE",
            COM_STMT_EXECUTE => "COM_STMT_EXECUTE",
            COM_STMT_SEND_LONG_DATA => "COM_STMT_SEND_LONG_DATA",
            COM_STMT_CLOSE => "COM_STMT_CLOSE",
            COM_STMT_RESET => "COM_STMT_RESET",
            COM_STMT_FETCH => "COM_STMT_FETCH",
            _ => "COM_UNKNOWN",
        }
    }
}
