//! Gatewire backend protocol core
//!
//! Per-connection protocol state for the proxy: packet framing, reply
//! reassembly, prepared-statement handle remapping and outbound
//! backpressure. Everything here is synchronous and never blocks; the
//! worker's event loop owns the sockets and calls in when bytes arrive or a
//! socket becomes writable.

pub mod backend;
pub mod backpressure;
pub mod constants;
pub mod error;
pub mod handler;
pub mod messages;
pub mod packet;
pub mod ps_map;
pub mod reply;

pub use backend::{BackendConnection, BackendStats, IncomingBatch};
pub use backpressure::{is_disconnect_error, BackpressureConfig, DrainStatus, QueueStats, WriteQueue};
pub use error::{ProtocolError, Result};
pub use handler::ConnectionHandler;
pub use packet::{FramerStats, Packet, PacketFramer};
pub use ps_map::{PreparedStatementMap, RewrittenCommand};
pub use reply::{ReplyState, ReplyStateMachine, ReplyStats, ReplyStatus, ServerError};
