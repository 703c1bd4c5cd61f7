//! Prepared-statement handle remapping
//!
//! Clients see statement ids chosen by the proxy. Each backend assigns its
//! own handle when it answers COM_STMT_PREPARE, so every command that
//! references a statement is rewritten before it reaches the backend.

use crate::constants::command::{self, COM_STMT_EXECUTE, COM_STMT_FETCH};
use crate::constants::{PACKET_HEADER_LEN, PS_ID_OFFSET, PS_ID_SIZE};
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use bytes::BytesMut;
use gatewire_common::ByteCursor;
use std::collections::HashMap;
use tracing::{debug, info};

/// A statement command rewritten for the backend
#[derive(Debug, Clone)]
pub struct RewrittenCommand {
    pub packet: Packet,
    pub command: u8,
    pub client_id: u32,
    pub backend_id: u32,
    /// Row count requested by COM_STMT_FETCH
    pub fetch_rows: Option<u32>,
    /// COM_STMT_EXECUTE asked the backend to open a cursor
    pub opens_cursor: bool,
}

/// Client id to backend handle map, owned by one backend connection
#[derive(Debug, Default)]
pub struct PreparedStatementMap {
    handles: HashMap<u32, u32>,
}

impl PreparedStatementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a mapping
    pub fn register(&mut self, client_id: u32, backend_handle: u32) {
        info!(
            "PS response for {}: {} -> {}",
            client_id, client_id, backend_handle
        );
        self.handles.insert(client_id, backend_handle);
    }

    /// Backend handle for a client id; a handle of 0 is a valid handle
    pub fn resolve(&self, client_id: u32) -> Option<u32> {
        self.handles.get(&client_id).copied()
    }

    /// Drop a mapping after the client closed the statement
    pub fn forget(&mut self, client_id: u32) -> Option<u32> {
        let removed = self.handles.remove(&client_id);
        if removed.is_some() {
            debug!("Closed PS {}", client_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    /// Rewrite the statement id of a command that references one.
    ///
    /// The packet is copied before the rewrite, so any other holder of the
    /// original bytes still sees the client id. COM_STMT_CLOSE also removes
    /// the mapping.
    pub fn rewrite(&mut self, packet: &Packet) -> Result<RewrittenCommand> {
        let payload = packet.payload();
        let mut cursor = ByteCursor::new(payload);
        let command = cursor.read_u8()?;
        let client_id = cursor.read_u32_le()?;

        let backend_id = self
            .resolve(client_id)
            .ok_or(ProtocolError::UnknownStatement(client_id))?;

        let mut fetch_rows = None;
        let mut opens_cursor = false;
        match command {
            COM_STMT_FETCH => {
                // Row count follows the statement id
                fetch_rows = Some(cursor.read_u32_le()?);
            }
            COM_STMT_EXECUTE => {
                // Any flag bit other than "no cursor" opens one
                opens_cursor = cursor.peek_u8().is_ok_and(|flags| flags != 0);
            }
            command::COM_STMT_CLOSE => {
                self.forget(client_id);
            }
            _ => {}
        }

        let mut raw = BytesMut::from(packet.as_bytes().as_ref());
        let start = PACKET_HEADER_LEN + PS_ID_OFFSET;
        raw[start..start + PS_ID_SIZE].copy_from_slice(&backend_id.to_le_bytes());

        debug!(
            command = command::name(command),
            client_id, backend_id, "Rewrote statement id"
        );

        Ok(RewrittenCommand {
            packet: Packet::from_raw(raw.freeze())?,
            command,
            client_id,
            backend_id,
            fetch_rows,
            opens_cursor,
        })
    }
}
