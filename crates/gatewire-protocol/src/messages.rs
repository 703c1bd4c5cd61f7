//! Wire packet builders
//!
//! Functions for constructing the packets the proxy sends to clients on its
//! own behalf (errors for unknown statements, backend failures) and the
//! packets used to drive the reply state machine in tests.

use crate::constants::{
    PS_ID_SIZE, REPLY_EOF, REPLY_ERR, REPLY_LOCAL_INFILE, REPLY_OK, SQL_STATE_LEN,
    SQL_STATE_MARKER,
};
use crate::packet::Packet;
use crate::reply::ServerError;
use gatewire_common::DecodeError;

/// Column type used for generated column definitions (VAR_STRING)
const FIELD_TYPE_VAR_STRING: u8 = 0xFD;

/// utf8mb4_general_ci
const DEFAULT_CHARSET: u16 = 45;

/// Append a length-encoded integer
pub fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 0xFB {
        buf.push(value as u8);
    } else if value <= 0xFFFF {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFF_FFFF {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Append a length-encoded string
pub fn write_lenenc_str(buf: &mut Vec<u8>, value: &[u8]) {
    write_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// OK packet
pub fn ok_packet(
    sequence: u8,
    affected_rows: u64,
    last_insert_id: u64,
    status: u16,
    warnings: u16,
) -> Packet {
    let mut buf = vec![REPLY_OK];
    write_lenenc_int(&mut buf, affected_rows);
    write_lenenc_int(&mut buf, last_insert_id);
    buf.extend_from_slice(&status.to_le_bytes());
    buf.extend_from_slice(&warnings.to_le_bytes());
    Packet::new(sequence, &buf)
}

/// ERR packet with an SQL state
///
/// SQL states that are not exactly five characters are replaced with the
/// generic `HY000`.
pub fn err_packet(sequence: u8, code: u16, sql_state: &str, message: &str) -> Packet {
    let state = if sql_state.len() == SQL_STATE_LEN {
        sql_state.as_bytes()
    } else {
        &b"HY000"[..]
    };

    let mut buf = Vec::with_capacity(9 + message.len());
    buf.push(REPLY_ERR);
    buf.extend_from_slice(&code.to_le_bytes());
    buf.push(SQL_STATE_MARKER);
    buf.extend_from_slice(state);
    buf.extend_from_slice(message.as_bytes());
    Packet::new(sequence, &buf)
}

/// EOF packet
pub fn eof_packet(sequence: u8, warnings: u16, status: u16) -> Packet {
    let mut buf = vec![REPLY_EOF];
    buf.extend_from_slice(&warnings.to_le_bytes());
    buf.extend_from_slice(&status.to_le_bytes());
    Packet::new(sequence, &buf)
}

/// First packet of a result set
pub fn column_count_packet(sequence: u8, columns: u64) -> Packet {
    let mut buf = Vec::with_capacity(9);
    write_lenenc_int(&mut buf, columns);
    Packet::new(sequence, &buf)
}

/// Minimal column definition for a string column
pub fn column_definition_packet(sequence: u8, name: &str) -> Packet {
    let mut buf = Vec::new();
    write_lenenc_str(&mut buf, b"def");
    write_lenenc_str(&mut buf, b"");
    write_lenenc_str(&mut buf, b"");
    write_lenenc_str(&mut buf, b"");
    write_lenenc_str(&mut buf, name.as_bytes());
    write_lenenc_str(&mut buf, name.as_bytes());
    // Length of the fixed-size fields that follow
    buf.push(0x0C);
    buf.extend_from_slice(&DEFAULT_CHARSET.to_le_bytes());
    buf.extend_from_slice(&1024u32.to_le_bytes());
    buf.push(FIELD_TYPE_VAR_STRING);
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.push(0);
    buf.extend_from_slice(&[0, 0]);
    Packet::new(sequence, &buf)
}

/// Text protocol row; `None` is sent as NULL (0xFB)
pub fn text_row_packet(sequence: u8, values: &[Option<&str>]) -> Packet {
    let mut buf = Vec::new();
    for value in values {
        match value {
            Some(v) => write_lenenc_str(&mut buf, v.as_bytes()),
            None => buf.push(0xFB),
        }
    }
    Packet::new(sequence, &buf)
}

/// Response to COM_STMT_PREPARE
pub fn prepare_ok_packet(
    sequence: u8,
    statement_id: u32,
    columns: u16,
    params: u16,
    warnings: u16,
) -> Packet {
    let mut buf = Vec::with_capacity(12);
    buf.push(REPLY_OK);
    buf.extend_from_slice(&statement_id.to_le_bytes());
    buf.extend_from_slice(&columns.to_le_bytes());
    buf.extend_from_slice(&params.to_le_bytes());
    buf.push(0);
    buf.extend_from_slice(&warnings.to_le_bytes());
    Packet::new(sequence, &buf)
}

/// Server request for the client to stream a local file
pub fn local_infile_packet(sequence: u8, filename: &str) -> Packet {
    let mut buf = Vec::with_capacity(1 + filename.len());
    buf.push(REPLY_LOCAL_INFILE);
    buf.extend_from_slice(filename.as_bytes());
    Packet::new(sequence, &buf)
}

/// Decode an ERR payload (marker byte included)
pub fn parse_err_payload(payload: &[u8]) -> Result<ServerError, DecodeError> {
    ServerError::parse(payload)
}

/// Client command packet; commands always start at sequence 0
pub fn command_packet(command: u8, body: &[u8]) -> Packet {
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(command);
    buf.extend_from_slice(body);
    Packet::new(0, &buf)
}

/// Client command that references a prepared statement
pub fn statement_command(command: u8, statement_id: u32, trailing: &[u8]) -> Packet {
    let mut buf = Vec::with_capacity(1 + PS_ID_SIZE + trailing.len());
    buf.push(command);
    buf.extend_from_slice(&statement_id.to_le_bytes());
    buf.extend_from_slice(trailing);
    Packet::new(0, &buf)
}
