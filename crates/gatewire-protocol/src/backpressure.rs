//! Backpressure-aware outbound buffering
//!
//! Sockets are non-blocking, so a write can accept fewer bytes than offered
//! or none at all. [`WriteQueue`] holds whatever the kernel did not take and
//! drains it with vectored writes on the next writable notification.
//!
//! ## How it works
//!
//! - Packets are queued as `Bytes`, never copied or coalesced
//! - `drain_with` hands up to `max_iovecs` buffers to one `writev`-style call
//!   and stops as soon as the transport reports `WouldBlock`
//! - Once the queued byte count reaches the high water mark the queue
//!   reports itself throttled, and stays throttled until it drains below the
//!   low water mark. Callers stop reading from the peer that feeds the queue
//!   while it is throttled.

use bytes::{Buf, Bytes};
use gatewire_common::config::env_parse_or_default;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, IoSlice};
use tracing::{debug, warn};

/// Configuration for outbound queueing
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Queued bytes at which the queue reports backpressure (default: 1MB)
    pub high_water_bytes: usize,

    /// Queued bytes below which backpressure is released (default: 256KB)
    pub low_water_bytes: usize,

    /// Buffers handed to one vectored write
    pub max_iovecs: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        let high_water_bytes: usize = env_parse_or_default("GATEWIRE_WRITEQ_HIGH_WATER", 1024 * 1024);
        let low_water_bytes: usize = env_parse_or_default("GATEWIRE_WRITEQ_LOW_WATER", 256 * 1024);

        Self {
            high_water_bytes,
            // Low water above high water would never release
            low_water_bytes: low_water_bytes.min(high_water_bytes),
            // Linux IOV_MAX is 1024, stay well below it
            max_iovecs: env_parse_or_default::<usize>("GATEWIRE_WRITEV_MAX_SLICES", 64).max(1),
        }
    }
}

/// Counters for one queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub bytes_queued: u64,
    pub bytes_written: u64,
    pub writes: u64,
    pub would_block: u64,
    pub throttle_events: u64,
    /// Largest number of bytes ever waiting in the queue
    pub peak_queued: usize,
}

/// Result of a drain attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Everything queued was written
    Complete,
    /// The transport cannot take more right now; wait for writability
    Blocked,
}

/// Outbound queue with high/low water mark backpressure
#[derive(Debug)]
pub struct WriteQueue {
    buffers: VecDeque<Bytes>,
    queued: usize,
    throttled: bool,
    config: BackpressureConfig,
    stats: QueueStats,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

impl WriteQueue {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            buffers: VecDeque::new(),
            queued: 0,
            throttled: false,
            config,
            stats: QueueStats::default(),
        }
    }

    /// Queue bytes for writing. Empty buffers are dropped.
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.queued += bytes.len();
        self.stats.bytes_queued += bytes.len() as u64;
        self.stats.peak_queued = self.stats.peak_queued.max(self.queued);
        self.buffers.push_back(bytes);

        if !self.throttled && self.queued >= self.config.high_water_bytes {
            self.throttled = true;
            self.stats.throttle_events += 1;
            debug!(
                "Write queue reached {} bytes, applying backpressure",
                self.queued
            );
        }
    }

    /// Write queued data through `write` until the queue is empty or the
    /// transport would block.
    ///
    /// `write` receives the front buffers as `IoSlice`s and returns how many
    /// bytes it accepted, like `writev`. Errors other than `WouldBlock` are
    /// returned and leave the unwritten bytes queued.
    pub fn drain_with<F>(&mut self, mut write: F) -> io::Result<DrainStatus>
    where
        F: FnMut(&[IoSlice<'_>]) -> io::Result<usize>,
    {
        while !self.buffers.is_empty() {
            let result = {
                let slices: Vec<IoSlice<'_>> = self
                    .buffers
                    .iter()
                    .take(self.config.max_iovecs)
                    .map(|b| IoSlice::new(b))
                    .collect();
                write(&slices)
            };

            match result {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ));
                }
                Ok(written) => {
                    self.stats.writes += 1;
                    self.advance(written);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.stats.would_block += 1;
                    self.update_throttle();
                    return Ok(DrainStatus::Blocked);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_disconnect_error(&e) {
                        debug!("Peer disconnected with {} bytes queued", self.queued);
                    } else {
                        warn!("Write failed with {} bytes queued: {}", self.queued, e);
                    }
                    return Err(e);
                }
            }
        }

        self.update_throttle();
        Ok(DrainStatus::Complete)
    }

    fn advance(&mut self, mut written: usize) {
        self.queued = self.queued.saturating_sub(written);
        self.stats.bytes_written += written as u64;

        while written > 0 {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            if written >= front.len() {
                written -= front.len();
                self.buffers.pop_front();
            } else {
                front.advance(written);
                written = 0;
            }
        }
    }

    fn update_throttle(&mut self) {
        if self.throttled && self.queued <= self.config.low_water_bytes {
            self.throttled = false;
            debug!("Write queue drained to {} bytes, releasing backpressure", self.queued);
        }
    }

    /// Whether the producer feeding this queue should pause
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes waiting to be written
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Drop everything queued (connection close)
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.queued = 0;
        self.throttled = false;
    }
}

/// Check if an IO error indicates the peer went away
pub fn is_disconnect_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}
