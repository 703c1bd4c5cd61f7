//! Data block decoding
//!
//! Each block is `[record_count][byte_count][payload][sync marker]`. The
//! two counts are zig-zag varints; the payload is compressed per the file
//! codec; the 16-byte marker must match the one in the file header.

use crate::codec::Codec;
use crate::encoding::{decode_record, read_varint_from, write_varint_long};
use crate::error::{ContainerError, Result, SyncMismatchKind, SYNC_MARKER_LEN};
use crate::schema::ContainerSchema;
use crate::value::Record;
use gatewire_common::{metrics, ByteCursor, DecodeError};
use std::io::{self, ErrorKind, Read, Seek};
use tracing::{debug, error};

/// Block header as read from the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub record_count: u64,
    pub byte_count: u64,
    /// Offset of the first header byte
    pub start_pos: u64,
    /// Offset of the first payload byte
    pub data_start: u64,
}

impl BlockHeader {
    /// Offset just past this block's sync marker
    pub fn end_pos(&self) -> u64 {
        self.data_start + self.byte_count + SYNC_MARKER_LEN as u64
    }
}

/// Read a block header starting at `start_pos`.
///
/// `Ok(None)` means the file ends at or inside the header: nothing more to
/// read yet. The caller is responsible for seeking back to `start_pos`.
pub fn read_block_header<R: Read>(reader: &mut R, start_pos: u64) -> Result<Option<BlockHeader>> {
    let Some((record_count, n1)) = read_header_varint(reader, start_pos)? else {
        return Ok(None);
    };
    let Some((byte_count, n2)) = read_header_varint(reader, start_pos + n1 as u64)? else {
        return Ok(None);
    };

    if record_count < 0 || byte_count < 0 {
        return Err(DecodeError::NegativeLength {
            offset: start_pos as usize,
            length: record_count.min(byte_count),
        }
        .into());
    }

    Ok(Some(BlockHeader {
        record_count: record_count as u64,
        byte_count: byte_count as u64,
        start_pos,
        data_start: start_pos + (n1 + n2) as u64,
    }))
}

fn read_header_varint<R: Read>(reader: &mut R, pos: u64) -> Result<Option<(i64, usize)>> {
    match read_varint_from(reader) {
        Ok(v) => Ok(v),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            Err(DecodeError::VarintOverflow(pos as usize).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads, verifies and decompresses one block
pub struct BlockDecoder;

impl BlockDecoder {
    /// Decode the block whose header has already been consumed.
    ///
    /// Reads exactly `header.byte_count` payload bytes and the trailing
    /// marker; never more.
    pub fn decode<R: Read + Seek>(
        reader: &mut R,
        header: BlockHeader,
        codec: Codec,
        sync: &[u8; SYNC_MARKER_LEN],
    ) -> Result<DataBlock> {
        let payload = read_payload(reader, &header)?;

        read_trailer(reader, &header, sync)?;

        let data = codec.decompress(&payload)?;
        metrics::record_block_read(header.byte_count);

        debug!(
            offset = header.start_pos,
            records = header.record_count,
            compressed = header.byte_count,
            decoded = data.len(),
            "Decoded block"
        );

        Ok(DataBlock {
            record_count: header.record_count,
            data,
            pos: 0,
            records_read: 0,
            start_pos: header.start_pos,
            byte_count: header.byte_count,
        })
    }

    /// Read one block without decompressing it, returning the exact bytes
    /// as stored: header varints, payload and sync marker.
    pub fn read_raw<R: Read + Seek>(
        reader: &mut R,
        header: BlockHeader,
        sync: &[u8; SYNC_MARKER_LEN],
    ) -> Result<Vec<u8>> {
        let payload = read_payload(reader, &header)?;

        let marker = read_trailer(reader, &header, sync)?;

        let mut raw = Vec::with_capacity((header.end_pos() - header.start_pos) as usize);
        write_varint_long(&mut raw, header.record_count as i64);
        write_varint_long(&mut raw, header.byte_count as i64);
        raw.extend_from_slice(&payload);
        raw.extend_from_slice(&marker);
        Ok(raw)
    }
}

fn read_payload<R: Read>(reader: &mut R, header: &BlockHeader) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(header.byte_count.min(16 * 1024 * 1024) as usize);
    reader.by_ref().take(header.byte_count).read_to_end(&mut payload)?;

    if (payload.len() as u64) < header.byte_count {
        return Err(ContainerError::TruncatedBlock {
            offset: header.start_pos,
            needed: header.byte_count,
            available: payload.len() as u64,
        });
    }
    Ok(payload)
}

/// Read the 16 bytes following the payload and check them against `sync`
fn read_trailer<R: Read + Seek>(
    reader: &mut R,
    header: &BlockHeader,
    sync: &[u8; SYNC_MARKER_LEN],
) -> Result<[u8; SYNC_MARKER_LEN]> {
    let mut marker = [0u8; SYNC_MARKER_LEN];
    let got = read_up_to(reader, &mut marker)?;
    if got < SYNC_MARKER_LEN {
        return Err(ContainerError::TruncatedBlock {
            offset: header.start_pos,
            needed: header.byte_count + SYNC_MARKER_LEN as u64,
            available: header.byte_count + got as u64,
        });
    }

    let actual_pos = reader.stream_position()?;
    verify_sync(header, sync, &marker, actual_pos)?;
    Ok(marker)
}

/// Like `read_exact`, but reports how much was read before EOF
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn verify_sync(
    header: &BlockHeader,
    expected: &[u8; SYNC_MARKER_LEN],
    actual: &[u8; SYNC_MARKER_LEN],
    actual_pos: u64,
) -> Result<()> {
    if actual == expected {
        return Ok(());
    }

    let expected_pos = header.end_pos();
    let kind = if actual_pos != expected_pos {
        SyncMismatchKind::WrongOffset
    } else {
        SyncMismatchKind::MarkerDiffers
    };

    error!(
        block_offset = header.start_pos,
        expected_pos,
        actual_pos,
        kind = kind.as_str(),
        "Sync marker mismatch: expected {:02x?}, got {:02x?}",
        expected,
        actual
    );
    metrics::record_sync_error(kind.as_str());

    Err(ContainerError::SyncMismatch {
        kind,
        expected_pos,
        actual_pos,
        expected: *expected,
        actual: *actual,
    })
}

/// One decoded block and the read position inside it
#[derive(Debug)]
pub struct DataBlock {
    record_count: u64,
    data: Vec<u8>,
    pos: usize,
    records_read: u64,
    start_pos: u64,
    byte_count: u64,
}

impl DataBlock {
    /// All records of this block have been read
    pub fn is_exhausted(&self) -> bool {
        self.records_read >= self.record_count
    }

    /// Decode the next record, or `None` once the block is exhausted
    pub fn read_record(&mut self, schema: &ContainerSchema) -> Result<Option<Record>> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let mut cursor = ByteCursor::new(&self.data[self.pos..]);
        let record = decode_record(&mut cursor, schema)?;
        self.pos += cursor.position();
        self.records_read += 1;
        metrics::record_record_read();
        Ok(Some(record))
    }

    /// Decode and discard up to `count` records, returning how many were skipped
    pub fn skip_records(&mut self, schema: &ContainerSchema, count: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < count && self.read_record(schema)?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Size of the payload as stored in the file
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Size of the decompressed payload
    pub fn decoded_len(&self) -> usize {
        self.data.len()
    }

    pub fn start_pos(&self) -> u64 {
        self.start_pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_record;
    use crate::schema::{Field, FieldType};
    use crate::value::Value;
    use std::io::Cursor;

    const SYNC: [u8; SYNC_MARKER_LEN] = [0x5A; SYNC_MARKER_LEN];

    fn schema() -> ContainerSchema {
        ContainerSchema::from_fields(
            "Row",
            vec![Field::new("id", FieldType::Long), Field::new("name", FieldType::String)],
        )
    }

    fn encode_block(codec: Codec, rows: &[(i64, &str)]) -> Vec<u8> {
        let schema = schema();
        let mut payload = Vec::new();
        for (id, name) in rows {
            let record = Record::new()
                .with("id", Value::Long(*id))
                .with("name", Value::String(name.to_string()));
            encode_record(&mut payload, &schema, &record).unwrap();
        }
        let payload = codec.compress(&payload).unwrap();

        let mut block = Vec::new();
        write_varint_long(&mut block, rows.len() as i64);
        write_varint_long(&mut block, payload.len() as i64);
        block.extend_from_slice(&payload);
        block.extend_from_slice(&SYNC);
        block
    }

    fn decode_all(bytes: Vec<u8>, codec: Codec) -> Result<DataBlock> {
        let mut reader = Cursor::new(bytes);
        let header = read_block_header(&mut reader, 0)?.unwrap();
        BlockDecoder::decode(&mut reader, header, codec, &SYNC)
    }

    #[test]
    fn test_decode_block_records() {
        for codec in [Codec::Null, Codec::Deflate] {
            let bytes = encode_block(codec, &[(1, "a"), (2, "bb"), (3, "ccc")]);
            let mut block = decode_all(bytes, codec).unwrap();
            let schema = schema();

            assert_eq!(block.record_count(), 3);
            let first = block.read_record(&schema).unwrap().unwrap();
            assert_eq!(first.get("id"), Some(&Value::Long(1)));
            assert_eq!(block.skip_records(&schema, 5).unwrap(), 2);
            assert!(block.is_exhausted());
            assert!(block.read_record(&schema).unwrap().is_none());
        }
    }

    #[test]
    fn test_header_positions() {
        let bytes = encode_block(Codec::Null, &[(1, "a")]);
        let mut reader = Cursor::new(bytes.clone());
        let header = read_block_header(&mut reader, 0).unwrap().unwrap();
        assert_eq!(header.data_start, 2);
        assert_eq!(header.end_pos(), bytes.len() as u64);
    }

    #[test]
    fn test_empty_or_partial_header_is_not_an_error() {
        assert!(read_block_header(&mut Cursor::new(Vec::new()), 0).unwrap().is_none());
        // Record count present, byte count missing
        assert!(read_block_header(&mut Cursor::new(vec![0x06]), 0).unwrap().is_none());
        // Continuation bit set on the last available byte
        assert!(read_block_header(&mut Cursor::new(vec![0x06, 0x80]), 0).unwrap().is_none());
    }

    #[test]
    fn test_negative_count_rejected() {
        let err = read_block_header(&mut Cursor::new(vec![0x01, 0x02]), 0).unwrap_err();
        assert!(matches!(err, ContainerError::Decode(DecodeError::NegativeLength { .. })));
    }

    #[test]
    fn test_declared_size_beyond_file_is_truncated() {
        let mut bytes = Vec::new();
        write_varint_long(&mut bytes, 1);
        write_varint_long(&mut bytes, 1000);
        bytes.extend_from_slice(&[0u8; 10]);

        let err = decode_all(bytes, Codec::Null).unwrap_err();
        assert!(matches!(
            err,
            ContainerError::TruncatedBlock { needed: 1000, available: 10, .. }
        ));
    }

    #[test]
    fn test_missing_sync_marker_is_truncated() {
        let mut bytes = encode_block(Codec::Null, &[(1, "a")]);
        bytes.truncate(bytes.len() - 4);
        let err = decode_all(bytes, Codec::Null).unwrap_err();
        assert!(matches!(err, ContainerError::TruncatedBlock { .. }));
    }

    #[test]
    fn test_marker_differs() {
        let mut bytes = encode_block(Codec::Null, &[(1, "a")]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        match decode_all(bytes, Codec::Null).unwrap_err() {
            ContainerError::SyncMismatch {
                kind,
                expected_pos,
                actual_pos,
                ..
            } => {
                assert_eq!(kind, SyncMismatchKind::MarkerDiffers);
                assert_eq!(expected_pos, actual_pos);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_offset_when_position_is_stale() {
        let mut bytes = encode_block(Codec::Null, &[(1, "a")]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut reader = Cursor::new(bytes);
        // Caller believes the block starts 3 bytes later than it does
        let header = read_block_header(&mut reader, 3).unwrap().unwrap();

        match BlockDecoder::decode(&mut reader, header, Codec::Null, &SYNC) {
            Err(ContainerError::SyncMismatch { kind, .. }) => {
                assert_eq!(kind, SyncMismatchKind::WrongOffset)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_snappy_block_fails_explicitly() {
        let bytes = encode_block(Codec::Null, &[(1, "a")]);
        let err = decode_all(bytes, Codec::Snappy).unwrap_err();
        assert!(matches!(err, ContainerError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_read_raw_reproduces_block() {
        let bytes = encode_block(Codec::Deflate, &[(7, "raw")]);
        let mut reader = Cursor::new(bytes.clone());
        let header = read_block_header(&mut reader, 0).unwrap().unwrap();
        let raw = BlockDecoder::read_raw(&mut reader, header, &SYNC).unwrap();
        assert_eq!(raw, bytes);
    }
}
