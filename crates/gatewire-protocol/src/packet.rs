//! Packet framing for backend byte streams
//!
//! A packet is a 3-byte little-endian payload length, a 1-byte sequence
//! number and `length` bytes of payload. Socket reads rarely line up with
//! packet boundaries, so [`PacketFramer`] accumulates bytes and only yields a
//! packet once all of it has arrived.

use crate::constants::{MAX_PACKET_PAYLOAD, PACKET_HEADER_LEN};
use crate::error::{ProtocolError, Result};
use bytes::{Bytes, BytesMut};
use gatewire_common::metrics;

/// One complete wire packet, header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    raw: Bytes,
}

impl Packet {
    /// Build a packet from a sequence number and payload.
    ///
    /// The payload must fit in one packet; [`Packet::split`] handles longer
    /// values.
    pub fn new(sequence: u8, payload: &[u8]) -> Self {
        debug_assert!(
            payload.len() <= MAX_PACKET_PAYLOAD,
            "payload of {} bytes needs continuation packets",
            payload.len()
        );
        let mut raw = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len());
        let len = payload.len() as u32;
        raw.extend_from_slice(&len.to_le_bytes()[..3]);
        raw.extend_from_slice(&[sequence]);
        raw.extend_from_slice(payload);
        Self { raw: raw.freeze() }
    }

    /// Packets carrying a payload of any length, with consecutive sequence
    /// numbers. Every packet but the last has the maximum length, so a
    /// payload that is an exact multiple of it ends with an empty packet.
    pub fn split(first_sequence: u8, payload: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(payload.len() / MAX_PACKET_PAYLOAD + 1);
        let mut chunks = payload.chunks(MAX_PACKET_PAYLOAD);
        let mut sequence = first_sequence;
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            packets.push(Packet::new(sequence, chunk));
            sequence = sequence.wrapping_add(1);
            if chunk.len() < MAX_PACKET_PAYLOAD {
                return packets;
            }
        }
    }

    /// Wrap raw bytes that must hold exactly one packet
    pub fn from_raw(raw: Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_LEN {
            return Err(ProtocolError::ShortPacket(raw.len()));
        }
        let declared = payload_len_of(&raw);
        if raw.len() != PACKET_HEADER_LEN + declared {
            return Err(ProtocolError::ShortPacket(raw.len()));
        }
        Ok(Self { raw })
    }

    /// Declared payload length
    pub fn payload_len(&self) -> usize {
        payload_len_of(&self.raw)
    }

    pub fn sequence(&self) -> u8 {
        self.raw[3]
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[PACKET_HEADER_LEN..]
    }

    /// First payload byte: the command for client packets, the reply
    /// marker for server packets
    pub fn command(&self) -> Option<u8> {
        self.payload().first().copied()
    }

    /// A maximum-length packet means the same logical message continues in
    /// the next packet
    pub fn is_continuation(&self) -> bool {
        self.payload_len() == MAX_PACKET_PAYLOAD
    }

    /// Header plus payload
    pub fn total_len(&self) -> usize {
        self.raw.len()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }
}

fn payload_len_of(raw: &[u8]) -> usize {
    usize::from(raw[0]) | (usize::from(raw[1]) << 8) | (usize::from(raw[2]) << 16)
}

/// Framing counters for diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramerStats {
    pub packets_framed: u64,
    pub bytes_framed: u64,
    pub continuations: u64,
}

/// Extracts complete packets from a stream of socket reads
#[derive(Debug, Default)]
pub struct PacketFramer {
    buffer: BytesMut,
    stats: FramerStats,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes. Never blocks.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete packet, or `None` when more data is needed.
    /// A partial packet stays buffered untouched.
    pub fn next_packet(&mut self) -> Option<Packet> {
        if self.buffer.len() < PACKET_HEADER_LEN {
            return None;
        }

        let len = payload_len_of(&self.buffer);
        if self.buffer.len() < PACKET_HEADER_LEN + len {
            return None;
        }

        let raw = self.buffer.split_to(PACKET_HEADER_LEN + len).freeze();
        self.stats.packets_framed += 1;
        self.stats.bytes_framed += raw.len() as u64;
        if len == MAX_PACKET_PAYLOAD {
            self.stats.continuations += 1;
        }
        metrics::record_packet_framed();

        Some(Packet { raw })
    }

    /// Bytes received but not yet framed
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Drop any partial packet
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stream_of(payloads: &[&[u8]]) -> Vec<u8> {
        payloads
            .iter()
            .enumerate()
            .flat_map(|(seq, p)| Packet::new(seq as u8, p).into_bytes().to_vec())
            .collect()
    }

    #[test]
    fn test_packet_header_layout() {
        let packet = Packet::new(7, &[0x03, b'S', b'E', b'L']);
        assert_eq!(&packet.as_bytes()[..4], &[4, 0, 0, 7]);
        assert_eq!(packet.payload_len(), 4);
        assert_eq!(packet.sequence(), 7);
        assert_eq!(packet.command(), Some(0x03));
        assert!(!packet.is_continuation());
    }

    #[test]
    fn test_oversized_payload_is_split_into_continuations() {
        let mut payload = vec![b'x'; MAX_PACKET_PAYLOAD + 10];
        payload[0] = 0x03;
        let packets = Packet::split(3, &payload);

        assert_eq!(packets.len(), 2);
        assert!(packets[0].is_continuation());
        assert_eq!(packets[0].sequence(), 3);
        assert_eq!(packets[1].payload_len(), 10);
        assert_eq!(packets[1].sequence(), 4);

        // Framing the pieces gives back the same packets
        let mut framer = PacketFramer::new();
        for packet in &packets {
            framer.feed(packet.as_bytes());
        }
        assert_eq!(framer.next_packet().as_ref(), Some(&packets[0]));
        assert_eq!(framer.next_packet().as_ref(), Some(&packets[1]));
    }

    #[test]
    fn test_split_of_exact_multiple_ends_with_empty_packet() {
        let payload = vec![0u8; MAX_PACKET_PAYLOAD];
        let packets = Packet::split(0, &payload);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].payload_len(), 0);

        let packets = Packet::split(0, b"\x0e");
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].is_continuation());
    }

    #[test]
    fn test_partial_packet_is_retained() {
        let bytes = stream_of(&[b"\x00\x01\x00\x02\x00\x00\x00"]);
        let mut framer = PacketFramer::new();

        framer.feed(&bytes[..3]);
        assert!(framer.next_packet().is_none());
        framer.feed(&bytes[3..6]);
        assert!(framer.next_packet().is_none());
        assert_eq!(framer.buffered_len(), 6);

        framer.feed(&bytes[6..]);
        let packet = framer.next_packet().unwrap();
        assert_eq!(packet.payload(), b"\x00\x01\x00\x02\x00\x00\x00");
        assert_eq!(framer.buffered_len(), 0);
        assert!(framer.next_packet().is_none());
    }

    #[test]
    fn test_multiple_packets_in_one_read() {
        let bytes = stream_of(&[b"\x01", b"abc", b""]);
        let mut framer = PacketFramer::new();
        framer.feed(&bytes);

        let lens: Vec<usize> = std::iter::from_fn(|| framer.next_packet())
            .map(|p| p.payload_len())
            .collect();
        assert_eq!(lens, vec![1, 3, 0]);
        assert_eq!(framer.stats().packets_framed, 3);
    }

    #[test]
    fn test_continuation_flag() {
        let payload = vec![0u8; MAX_PACKET_PAYLOAD];
        let mut framer = PacketFramer::new();
        framer.feed(&Packet::new(0, &payload).into_bytes());
        framer.feed(&Packet::new(1, b"tail").into_bytes());

        let first = framer.next_packet().unwrap();
        let second = framer.next_packet().unwrap();
        assert!(first.is_continuation());
        assert!(!second.is_continuation());
        assert_eq!(framer.stats().continuations, 1);
    }

    #[test]
    fn test_from_raw_validates_length() {
        assert!(Packet::from_raw(Bytes::from_static(&[1, 0])).is_err());
        assert!(Packet::from_raw(Bytes::from_static(&[2, 0, 0, 0, 1])).is_err());
        let packet = Packet::from_raw(Bytes::from_static(&[1, 0, 0, 0, 0x0E])).unwrap();
        assert_eq!(packet.command(), Some(0x0E));
    }

    proptest! {
        #[test]
        fn prop_byte_at_a_time_matches_bulk_feed(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..12)
        ) {
            let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
            let bytes = stream_of(&refs);

            let mut bulk = PacketFramer::new();
            bulk.feed(&bytes);
            let bulk_packets: Vec<Packet> = std::iter::from_fn(|| bulk.next_packet()).collect();

            let mut trickle = PacketFramer::new();
            let mut trickle_packets = Vec::new();
            for b in &bytes {
                trickle.feed(std::slice::from_ref(b));
                while let Some(p) = trickle.next_packet() {
                    trickle_packets.push(p);
                }
            }

            prop_assert_eq!(bulk_packets.len(), payloads.len());
            prop_assert_eq!(bulk_packets, trickle_packets);
        }
    }
}
