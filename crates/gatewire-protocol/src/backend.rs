//! Backend connection protocol state
//!
//! Ties together the framer, the reply state machine and the prepared
//! statement map for one backend server connection. Socket IO belongs to the
//! caller: outbound packets are queued in a [`WriteQueue`] and inbound bytes
//! are handed to [`BackendConnection::process_incoming`].

use crate::backpressure::{BackpressureConfig, DrainStatus, WriteQueue};
use crate::constants::command::{self, COM_STMT_PREPARE};
use crate::constants::{PACKET_HEADER_LEN, PS_ID_OFFSET, PS_ID_SIZE, REPLY_OK};
use crate::error::{ProtocolError, Result};
use crate::handler::{ConnectionHandler, VectoredWrite};
use crate::packet::{Packet, PacketFramer};
use crate::ps_map::PreparedStatementMap;
use crate::reply::{ReplyState, ReplyStateMachine, ReplyStatus};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use tracing::{debug, info, warn};

/// What one batch of backend bytes produced
#[derive(Debug, Default)]
pub struct IncomingBatch {
    /// Complete packets to relay to the client, in arrival order
    pub forward: BytesMut,
    /// Results completed by this batch, one per result of a chain
    pub results_completed: usize,
    /// At least one response the connection was waiting for is complete
    pub response_ready: bool,
    /// Responses completed by this batch; each response is counted once
    pub responses_completed: usize,
    /// The backend asked the client to stream a local file
    pub local_infile_requested: bool,
    /// Protocol-state errors seen while consuming the batch
    pub errors: Vec<ProtocolError>,
}

impl IncomingBatch {
    /// Whether any error means the connection should be closed
    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(ProtocolError::is_fatal)
    }
}

/// Per-connection counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub commands_written: u64,
    pub packets_written: u64,
    pub packets_read: u64,
    pub bytes_read: u64,
    pub responses: u64,
}

/// A written command whose response has not started yet
#[derive(Debug, Clone, Copy)]
struct PendingResponse {
    command: u8,
    opens_cursor: bool,
    fetch_rows: Option<u32>,
    /// Client id reserved for a COM_STMT_PREPARE
    prepare_id: Option<u32>,
}

/// Protocol state of one backend connection
#[derive(Debug)]
pub struct BackendConnection {
    name: String,
    framer: PacketFramer,
    reply: ReplyStateMachine,
    statements: PreparedStatementMap,
    outbound: WriteQueue,
    /// The last written packet had the maximum length; the next one continues it
    large_query: bool,
    /// The client is streaming a LOAD DATA LOCAL file
    load_data_active: bool,
    awaiting_response: bool,
    /// Commands written behind the one being answered, oldest first
    pending: VecDeque<PendingResponse>,
    /// Client id handed out for the prepare in flight
    pending_prepare: Option<u32>,
    next_statement_id: u32,
    stats: BackendStats,
}

impl BackendConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, BackpressureConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: BackpressureConfig) -> Self {
        Self {
            name: name.into(),
            framer: PacketFramer::new(),
            reply: ReplyStateMachine::new(),
            statements: PreparedStatementMap::new(),
            outbound: WriteQueue::new(config),
            large_query: false,
            load_data_active: false,
            awaiting_response: false,
            pending: VecDeque::new(),
            pending_prepare: None,
            next_statement_id: 1,
            stats: BackendStats::default(),
        }
    }

    /// Queue a client command, deciding from its command byte whether the
    /// backend will answer it
    pub fn write_command(&mut self, packet: Packet) -> Result<()> {
        let expects_response = packet.command().is_some_and(command::will_respond);
        self.write(packet, expects_response)
    }

    /// Queue a packet for the backend.
    ///
    /// Continuations of a large packet and LOAD DATA file contents bypass
    /// reply tracking. Statement commands are copied and their statement id
    /// rewritten to the backend handle. A command written while another
    /// response is in flight waits in a FIFO and is tracked once the
    /// earlier responses are complete.
    pub fn write(&mut self, packet: Packet, expects_response: bool) -> Result<()> {
        if self.large_query {
            // The server already knows more of this query is coming
            self.large_query = packet.is_continuation();
            self.queue(packet);
            return Ok(());
        }

        if self.load_data_active {
            if packet.payload_len() == 0 {
                debug!(backend = %self.name, "LOAD DATA LOCAL INFILE complete");
                self.load_data_active = false;
                // The server answers the end of the file with OK or ERR
                let command = self.reply.command();
                self.reply.begin_response(command);
                self.awaiting_response = true;
            }
            self.queue(packet);
            return Ok(());
        }

        let Some(cmd) = packet.command() else {
            return Err(ProtocolError::ShortPacket(packet.total_len()));
        };

        let mut fetch_rows = None;
        let mut opens_cursor = false;
        let packet = if command::references_statement(cmd) {
            let rewritten = self.statements.rewrite(&packet)?;
            fetch_rows = rewritten.fetch_rows;
            opens_cursor = rewritten.opens_cursor;
            rewritten.packet
        } else {
            packet
        };

        if expects_response {
            let prepare_id = (cmd == COM_STMT_PREPARE).then(|| self.allocate_statement_id());
            let response = PendingResponse {
                command: cmd,
                opens_cursor,
                fetch_rows,
                prepare_id,
            };
            if self.awaiting_response {
                debug!(
                    backend = %self.name,
                    command = command::name(cmd),
                    queued = self.pending.len() + 1,
                    "Command pipelined behind an unfinished response"
                );
                self.pending.push_back(response);
            } else {
                self.start_response(response);
            }
        }

        debug!(
            backend = %self.name,
            command = command::name(cmd),
            len = packet.payload_len(),
            "Queued command"
        );
        self.stats.commands_written += 1;
        self.large_query = packet.is_continuation();
        self.queue(packet);
        Ok(())
    }

    fn start_response(&mut self, response: PendingResponse) {
        self.reply.begin_response(response.command);
        self.reply.set_opening_cursor(response.opens_cursor);
        if let Some(rows) = response.fetch_rows {
            self.reply.set_expected_rows(rows);
        }
        self.pending_prepare = response.prepare_id;
        self.awaiting_response = true;
    }

    fn queue(&mut self, packet: Packet) {
        self.stats.packets_written += 1;
        self.outbound.push(packet.into_bytes());
    }

    fn allocate_statement_id(&mut self) -> u32 {
        let id = self.next_statement_id;
        self.next_statement_id = self.next_statement_id.wrapping_add(1).max(1);
        id
    }

    /// Set the client-visible id the next prepared statement receives.
    /// Routers that spread one session over several backends use this to
    /// keep ids unique across them.
    pub fn set_next_statement_id(&mut self, id: u32) {
        self.next_statement_id = id.max(1);
    }

    /// Feed bytes read from the backend socket.
    ///
    /// Every complete packet is run through the reply state machine and
    /// queued for the client. Partial packets stay buffered until the rest
    /// arrives.
    pub fn process_incoming(&mut self, bytes: &[u8]) -> IncomingBatch {
        self.stats.bytes_read += bytes.len() as u64;
        self.framer.feed(bytes);

        let mut batch = IncomingBatch::default();
        while let Some(packet) = self.framer.next_packet() {
            self.stats.packets_read += 1;

            let prepare_ok = self.reply.command() == COM_STMT_PREPARE
                && self.reply.state() == ReplyState::Start
                && packet.command() == Some(REPLY_OK);

            let status = match self.reply.consume(&packet) {
                Ok(status) => status,
                Err(e) => {
                    warn!(backend = %self.name, "Protocol error: {}", e);
                    batch.errors.push(e);
                    // Relay what the backend sent; the client sees the same bytes
                    batch.forward.extend_from_slice(packet.as_bytes());
                    continue;
                }
            };

            if prepare_ok {
                match self.register_prepared(&packet) {
                    Ok(rewritten) => batch.forward.extend_from_slice(&rewritten),
                    Err(e) => {
                        batch.forward.extend_from_slice(packet.as_bytes());
                        batch.errors.push(e);
                    }
                }
            } else {
                batch.forward.extend_from_slice(packet.as_bytes());
            }

            if status.is_complete() {
                batch.results_completed += 1;
            }

            if status == ReplyStatus::ResponseComplete {
                if self.reply.command() == COM_STMT_PREPARE {
                    // An ERR answer leaves the allocated id unused
                    self.pending_prepare = None;
                }

                if self.reply.local_infile_requested() {
                    self.reply.clear_local_infile();
                    self.load_data_active = true;
                    batch.local_infile_requested = true;
                    debug!(backend = %self.name, "Backend requested LOAD DATA LOCAL INFILE");
                }

                if self.awaiting_response {
                    self.awaiting_response = false;
                    self.stats.responses += 1;
                    batch.response_ready = true;
                    batch.responses_completed += 1;

                    // File contents come next; pipelined commands wait for the
                    // answer to the end of the file
                    if !self.load_data_active {
                        if let Some(next) = self.pending.pop_front() {
                            self.start_response(next);
                        }
                    }
                }
            }
        }

        batch
    }

    /// Register the backend handle of a prepare-OK and rewrite the packet to
    /// carry the client id
    fn register_prepared(&mut self, packet: &Packet) -> Result<BytesMut> {
        let payload = packet.payload();
        let start = PS_ID_OFFSET;
        let end = start + PS_ID_SIZE;
        if payload.len() < end {
            return Err(ProtocolError::ShortPacket(packet.total_len()));
        }

        let mut handle = [0u8; PS_ID_SIZE];
        handle.copy_from_slice(&payload[start..end]);
        let backend_handle = u32::from_le_bytes(handle);

        let client_id = match self.pending_prepare.take() {
            Some(id) => id,
            None => self.allocate_statement_id(),
        };
        self.statements.register(client_id, backend_handle);

        let mut raw = BytesMut::from(packet.as_bytes().as_ref());
        raw[PACKET_HEADER_LEN + start..PACKET_HEADER_LEN + end]
            .copy_from_slice(&client_id.to_le_bytes());
        Ok(raw)
    }

    /// Drain queued packets into the backend socket
    pub fn flush(&mut self, write: &mut VectoredWrite<'_>) -> io::Result<DrainStatus> {
        self.outbound.drain_with(|slices| write(slices))
    }

    /// Discard in-flight reply state and prepared statements. The socket
    /// itself is closed by its owner.
    pub fn close(&mut self) {
        info!(
            backend = %self.name,
            statements = self.statements.len(),
            pending_bytes = self.outbound.queued_bytes(),
            "Closing backend connection"
        );
        self.reply.reset();
        self.statements.clear();
        self.framer.clear();
        self.outbound.clear();
        self.large_query = false;
        self.load_data_active = false;
        self.awaiting_response = false;
        self.pending.clear();
        self.pending_prepare = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reply(&self) -> &ReplyStateMachine {
        &self.reply
    }

    pub fn statements(&self) -> &PreparedStatementMap {
        &self.statements
    }

    pub fn outbound(&self) -> &WriteQueue {
        &self.outbound
    }

    /// Waiting for the backend to finish a response
    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    /// Commands written behind the response in flight
    pub fn pipelined_commands(&self) -> usize {
        self.pending.len()
    }

    pub fn is_load_data_active(&self) -> bool {
        self.load_data_active
    }

    /// The next client packet continues a maximum-length packet
    pub fn is_large_query_active(&self) -> bool {
        self.large_query
    }

    pub fn stats(&self) -> BackendStats {
        self.stats
    }
}

impl ConnectionHandler for BackendConnection {
    type Output = IncomingBatch;

    fn on_readable(&mut self, bytes: &[u8]) -> IncomingBatch {
        self.process_incoming(bytes)
    }

    fn on_writable(&mut self, write: &mut VectoredWrite<'_>) -> io::Result<DrainStatus> {
        self.flush(write)
    }

    fn on_hangup(&mut self) {
        self.close();
    }
}
