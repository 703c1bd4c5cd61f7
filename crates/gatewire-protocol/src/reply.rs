//! Backend reply reassembly
//!
//! A backend answers one command with a sequence of packets: a single
//! OK/ERR, or a result set (column count, column definitions, EOF, rows,
//! EOF), possibly chained into several result sets when the terminating
//! packet carries the "more results exist" status bit.
//!
//! [`ReplyStateMachine`] consumes those packets in arrival order and decides
//! when a result, and the response as a whole, is complete:
//!
//! ```text
//! START ──OK/ERR/LOCAL_INFILE──────────────────────────────► DONE
//!   │                                                        ▲
//!   └─column count─► RSET_COLDEF ─► RSET_COLDEF_EOF ─► RSET_ROWS
//!                                        │ (cursor)          │
//!                                        └───────► DONE      └─EOF+more─► START
//! ```
//!
//! Row packets are counted but never interpreted.

use crate::constants::command::{
    COM_FIELD_LIST, COM_STATISTICS, COM_STMT_FETCH, COM_STMT_PREPARE,
};
use crate::constants::{
    EOF_PAYLOAD_LEN, REPLY_EOF, REPLY_ERR, REPLY_LOCAL_INFILE, REPLY_OK,
    SERVER_MORE_RESULTS_EXIST, SQL_STATE_LEN, SQL_STATE_MARKER,
};
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use gatewire_common::{metrics, ByteCursor, DecodeError};
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Position of the reply state machine within one response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyState {
    /// Waiting for the first packet of a result
    Start,
    /// The response is complete
    Done,
    /// Reading column definitions
    RsetColdef,
    /// Waiting for the EOF that ends the column definitions
    RsetColdefEof,
    /// Reading rows until the terminating EOF or ERR
    RsetRows,
    /// Reading parameter and column definitions of a prepare response
    PrepareDefs,
}

impl ReplyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyState::Start => "START",
            ReplyState::Done => "DONE",
            ReplyState::RsetColdef => "RSET_COLDEF",
            ReplyState::RsetColdefEof => "RSET_COLDEF_EOF",
            ReplyState::RsetRows => "RSET_ROWS",
            ReplyState::PrepareDefs => "PREPARE_DEFS",
        }
    }
}

impl fmt::Display for ReplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the backend in an ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    /// Five character SQL state, empty when the packet carried none
    pub sql_state: String,
    pub message: String,
}

impl ServerError {
    /// Parse an ERR payload, marker byte included
    ///
    /// Layout: `0xFF`, 2-byte LE code, optional `#` + 5-byte SQL state,
    /// remaining bytes are the message.
    pub fn parse(payload: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(payload);
        cursor.skip(1)?;
        let code = cursor.read_u16_le()?;

        let sql_state = if cursor.peek_u8().ok() == Some(SQL_STATE_MARKER) {
            cursor.skip(1)?;
            String::from_utf8_lossy(cursor.read_bytes(SQL_STATE_LEN)?).into_owned()
        } else {
            String::new()
        };

        let message = String::from_utf8_lossy(cursor.read_rest()).into_owned();
        Ok(Self {
            code,
            sql_state,
            message,
        })
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "{}: {}", self.code, self.message)
        } else {
            write!(f, "{} ({}): {}", self.code, self.sql_state, self.message)
        }
    }
}

/// Outcome of consuming one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The current result needs more packets
    Pending,
    /// One result of a multi-result response finished and another follows
    ResultComplete,
    /// The whole response is complete
    ResponseComplete,
    /// The packet arrived after the response was already complete
    AfterComplete,
}

impl ReplyStatus {
    /// Whether this packet finished a result
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            ReplyStatus::ResultComplete | ReplyStatus::ResponseComplete
        )
    }
}

/// Transition and packet counters for diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplyStats {
    pub packets: u64,
    pub transitions: u64,
    pub responses: u64,
    pub unexpected_packets: u64,
}

/// Per-backend reply state machine
#[derive(Debug)]
pub struct ReplyStateMachine {
    state: ReplyState,
    command: u8,
    /// Column or prepare definitions still expected
    remaining_defs: u64,
    bytes: u64,
    rows: u64,
    field_count: u64,
    error: Option<ServerError>,
    opening_cursor: bool,
    cursor_opened: bool,
    local_infile: bool,
    /// Rows still owed by a COM_STMT_FETCH
    expected_rows: Option<u32>,
    fetch_requested: u32,
    skip_next: bool,
    stats: ReplyStats,
}

impl Default for ReplyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyStateMachine {
    /// A new state machine has no response outstanding
    pub fn new() -> Self {
        Self {
            state: ReplyState::Done,
            command: 0,
            remaining_defs: 0,
            bytes: 0,
            rows: 0,
            field_count: 0,
            error: None,
            opening_cursor: false,
            cursor_opened: false,
            local_infile: false,
            expected_rows: None,
            fetch_requested: 0,
            skip_next: false,
            stats: ReplyStats::default(),
        }
    }

    /// Reset for a newly dispatched command that expects a reply
    pub fn begin_response(&mut self, command: u8) {
        self.command = command;
        self.remaining_defs = 0;
        self.bytes = 0;
        self.rows = 0;
        self.field_count = 0;
        self.error = None;
        self.opening_cursor = false;
        self.cursor_opened = false;
        self.local_infile = false;
        self.expected_rows = None;
        self.fetch_requested = 0;
        self.set_state(ReplyState::Start);
    }

    /// The execute being tracked opens a cursor; its response ends after
    /// the column definitions
    pub fn set_opening_cursor(&mut self, opening: bool) {
        self.opening_cursor = opening;
    }

    /// The fetch being tracked asked for `rows` rows
    pub fn set_expected_rows(&mut self, rows: u32) {
        self.expected_rows = Some(rows);
        self.fetch_requested = rows;
    }

    /// Consume the next packet of the response
    pub fn consume(&mut self, packet: &Packet) -> Result<ReplyStatus> {
        self.stats.packets += 1;
        self.bytes += packet.total_len() as u64;

        // The packet after a maximum-length packet is the tail of the same
        // value and must not be reinterpreted
        let skip = self.skip_next;
        self.skip_next = packet.is_continuation();
        if skip {
            trace!("Skipping continuation packet of {} bytes", packet.payload_len());
            return Ok(self.idle_status());
        }

        let result = self.process_one_packet(packet);
        if let Err(ref e) = result {
            self.stats.unexpected_packets += 1;
            metrics::record_protocol_error(e.kind());
        }
        result
    }

    fn process_one_packet(&mut self, packet: &Packet) -> Result<ReplyStatus> {
        let payload = packet.payload();
        let cmd = packet.command();

        if self.command == COM_STMT_FETCH && self.state != ReplyState::Done {
            return self.process_fetch_packet(packet);
        }

        match self.state {
            ReplyState::Start => self.process_reply_start(packet),

            ReplyState::Done => {
                if cmd == Some(REPLY_ERR) {
                    // Late error for a response that was already complete
                    self.update_error(payload)?;
                    Ok(ReplyStatus::AfterComplete)
                } else if self.command == COM_STMT_FETCH && is_eof(packet) {
                    // EOF trailing a fetch whose row quota was already met
                    Ok(ReplyStatus::AfterComplete)
                } else {
                    Err(self.unexpected(packet))
                }
            }

            ReplyState::RsetColdef => {
                self.remaining_defs = self.remaining_defs.saturating_sub(1);
                if self.remaining_defs == 0 {
                    self.set_state(ReplyState::RsetColdefEof);
                }
                Ok(ReplyStatus::Pending)
            }

            ReplyState::RsetColdefEof => {
                if !is_eof(packet) {
                    return Err(self.unexpected(packet));
                }

                if self.opening_cursor {
                    self.opening_cursor = false;
                    self.cursor_opened = true;
                    info!("Cursor successfully opened");
                    self.set_state(ReplyState::Done);
                    Ok(ReplyStatus::ResponseComplete)
                } else {
                    self.set_state(ReplyState::RsetRows);
                    Ok(ReplyStatus::Pending)
                }
            }

            ReplyState::RsetRows => {
                if is_eof(packet) {
                    if eof_status(payload)? & SERVER_MORE_RESULTS_EXIST == 0 {
                        self.set_state(ReplyState::Done);
                        Ok(ReplyStatus::ResponseComplete)
                    } else {
                        self.set_state(ReplyState::Start);
                        Ok(ReplyStatus::ResultComplete)
                    }
                } else if cmd == Some(REPLY_ERR) {
                    self.update_error(payload)?;
                    self.set_state(ReplyState::Done);
                    Ok(ReplyStatus::ResponseComplete)
                } else {
                    self.rows += 1;
                    Ok(ReplyStatus::Pending)
                }
            }

            ReplyState::PrepareDefs => {
                self.remaining_defs = self.remaining_defs.saturating_sub(1);
                if self.remaining_defs == 0 {
                    self.set_state(ReplyState::Done);
                    Ok(ReplyStatus::ResponseComplete)
                } else {
                    Ok(ReplyStatus::Pending)
                }
            }
        }
    }

    fn process_reply_start(&mut self, packet: &Packet) -> Result<ReplyStatus> {
        let payload = packet.payload();

        if self.command == COM_STATISTICS {
            // A single string, no marker byte
            self.set_state(ReplyState::Done);
            return Ok(ReplyStatus::ResponseComplete);
        }

        match packet.command() {
            Some(REPLY_OK) if self.command == COM_STMT_PREPARE => {
                self.process_prepare_ok(payload)
            }

            Some(REPLY_OK) => {
                if ok_status(payload)? & SERVER_MORE_RESULTS_EXIST == 0 {
                    self.set_state(ReplyState::Done);
                    Ok(ReplyStatus::ResponseComplete)
                } else {
                    // Another result follows, stay in START
                    Ok(ReplyStatus::ResultComplete)
                }
            }

            Some(REPLY_LOCAL_INFILE) => {
                // The client must now stream the file; the server answers
                // that with its own OK or ERR
                self.local_infile = true;
                self.set_state(ReplyState::Done);
                Ok(ReplyStatus::ResponseComplete)
            }

            Some(REPLY_ERR) => {
                // Nothing ever follows an error packet
                self.update_error(payload)?;
                self.set_state(ReplyState::Done);
                Ok(ReplyStatus::ResponseComplete)
            }

            Some(REPLY_EOF) if self.command == COM_FIELD_LIST && is_eof(packet) => {
                // Field list of a table without columns
                self.set_state(ReplyState::Done);
                Ok(ReplyStatus::ResponseComplete)
            }

            Some(REPLY_EOF) | None => Err(self.unexpected(packet)),

            Some(_) if self.command == COM_FIELD_LIST => {
                // COM_FIELD_LIST sends column definitions as rows, without
                // a column count
                self.set_state(ReplyState::RsetRows);
                Ok(ReplyStatus::Pending)
            }

            Some(_) => {
                let columns = ByteCursor::new(payload).read_lenenc_int()?;
                if columns == 0 {
                    return Err(self.unexpected(packet));
                }
                self.field_count = columns;
                self.remaining_defs = columns;
                self.set_state(ReplyState::RsetColdef);
                Ok(ReplyStatus::Pending)
            }
        }
    }

    /// Prepare OK: marker, statement id, column count, parameter count,
    /// filler, warnings. Definitions for each follow, each group ended by an
    /// EOF.
    fn process_prepare_ok(&mut self, payload: &[u8]) -> Result<ReplyStatus> {
        let mut cursor = ByteCursor::new(payload);
        cursor.skip(1)?;
        let _statement_id = cursor.read_u32_le()?;
        let columns = u64::from(cursor.read_u16_le()?);
        let params = u64::from(cursor.read_u16_le()?);

        let mut expected = 0;
        if params > 0 {
            expected += params + 1;
        }
        if columns > 0 {
            expected += columns + 1;
        }

        self.field_count = columns;
        self.remaining_defs = expected;
        debug!(
            columns,
            params, "Prepare OK, expecting {} definition packets", expected
        );

        if expected == 0 {
            self.set_state(ReplyState::Done);
            Ok(ReplyStatus::ResponseComplete)
        } else {
            self.set_state(ReplyState::PrepareDefs);
            Ok(ReplyStatus::Pending)
        }
    }

    /// COM_STMT_FETCH completes on its row quota instead of an EOF; an EOF
    /// or ERR still ends it early.
    fn process_fetch_packet(&mut self, packet: &Packet) -> Result<ReplyStatus> {
        if packet.command() == Some(REPLY_ERR) {
            self.update_error(packet.payload())?;
            self.set_state(ReplyState::Done);
            return Ok(ReplyStatus::ResponseComplete);
        }

        if is_eof(packet) {
            self.set_state(ReplyState::Done);
            return Ok(ReplyStatus::ResponseComplete);
        }

        match self.expected_rows {
            Some(remaining) if remaining > 0 => {
                self.rows += 1;
                let remaining = remaining - 1;
                self.expected_rows = Some(remaining);
                if remaining == 0 {
                    self.set_state(ReplyState::Done);
                    Ok(ReplyStatus::ResponseComplete)
                } else {
                    Ok(ReplyStatus::Pending)
                }
            }
            _ => {
                warn!(
                    "Received a row beyond the {} requested by COM_STMT_FETCH",
                    self.fetch_requested
                );
                Err(ProtocolError::FetchUnderflow {
                    requested: self.fetch_requested,
                })
            }
        }
    }

    fn update_error(&mut self, payload: &[u8]) -> Result<()> {
        let error = ServerError::parse(payload)?;
        debug!(
            code = error.code,
            sql_state = %error.sql_state,
            "Backend returned error: {}",
            error.message
        );
        self.error = Some(error);
        Ok(())
    }

    fn unexpected(&self, packet: &Packet) -> ProtocolError {
        let command = packet.command().unwrap_or(0);
        warn!(
            "Unexpected result state. cmd: 0x{:02x}, len: {}, state: {}",
            command,
            packet.payload_len(),
            self.state
        );
        ProtocolError::UnexpectedPacket {
            state: self.state,
            command,
            len: packet.payload_len(),
        }
    }

    fn idle_status(&self) -> ReplyStatus {
        if self.state == ReplyState::Done {
            ReplyStatus::AfterComplete
        } else {
            ReplyStatus::Pending
        }
    }

    fn set_state(&mut self, state: ReplyState) {
        trace!("Reply state {} -> {}", self.state, state);
        metrics::record_reply_transition(self.state.as_str(), state.as_str());
        self.stats.transitions += 1;
        if state == ReplyState::Done {
            self.stats.responses += 1;
        }
        self.state = state;
    }

    /// Forget any in-flight response (connection close)
    pub fn reset(&mut self) {
        self.state = ReplyState::Done;
        self.command = 0;
        self.remaining_defs = 0;
        self.bytes = 0;
        self.rows = 0;
        self.field_count = 0;
        self.error = None;
        self.opening_cursor = false;
        self.cursor_opened = false;
        self.local_infile = false;
        self.expected_rows = None;
        self.fetch_requested = 0;
        self.skip_next = false;
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    /// Whether the response is complete
    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    /// Command whose response is being tracked
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Last error reported by the backend for this response
    pub fn error(&self) -> Option<&ServerError> {
        self.error.as_ref()
    }

    /// Bytes consumed for the current response, headers included
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Row packets seen for the current response
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Column count of the current result set
    pub fn field_count(&self) -> u64 {
        self.field_count
    }

    /// Column definitions still expected
    pub fn remaining_column_defs(&self) -> u64 {
        self.remaining_defs
    }

    /// Whether the backend asked the client to stream a local file
    pub fn local_infile_requested(&self) -> bool {
        self.local_infile
    }

    pub fn clear_local_infile(&mut self) {
        self.local_infile = false;
    }

    pub fn cursor_opened(&self) -> bool {
        self.cursor_opened
    }

    pub fn stats(&self) -> ReplyStats {
        self.stats
    }
}

fn is_eof(packet: &Packet) -> bool {
    packet.command() == Some(REPLY_EOF) && packet.payload_len() == EOF_PAYLOAD_LEN
}

/// Status flags of an OK payload: after the marker and two length-encoded
/// integers (affected rows, last insert id)
fn ok_status(payload: &[u8]) -> Result<u16> {
    let mut cursor = ByteCursor::new(payload);
    cursor.skip(1)?;
    cursor.skip_lenenc_int()?;
    cursor.skip_lenenc_int()?;
    Ok(cursor.read_u16_le()?)
}

/// Status flags of an EOF payload: after the marker and the 2-byte warning
/// count
fn eof_status(payload: &[u8]) -> Result<u16> {
    let mut cursor = ByteCursor::new(payload);
    cursor.skip(3)?;
    Ok(cursor.read_u16_le()?)
}
