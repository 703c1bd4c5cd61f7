//! Reactor callbacks
//!
//! The event loop that owns the sockets calls into protocol state through
//! this trait; the protocol state never touches a socket itself.

use crate::backpressure::DrainStatus;
use std::io::{self, IoSlice};

/// Vectored write into a non-blocking transport
pub type VectoredWrite<'a> = dyn FnMut(&[IoSlice<'_>]) -> io::Result<usize> + 'a;

/// Callbacks a worker's event loop invokes on one connection
pub trait ConnectionHandler {
    /// What a read produces for the layer above
    type Output;

    /// Bytes were read from the peer
    fn on_readable(&mut self, bytes: &[u8]) -> Self::Output;

    /// The transport can accept more bytes
    fn on_writable(&mut self, write: &mut VectoredWrite<'_>) -> io::Result<DrainStatus>;

    /// The peer closed the connection or the connection failed
    fn on_hangup(&mut self);
}
