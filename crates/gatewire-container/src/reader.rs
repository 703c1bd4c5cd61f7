//! Container file reader

use crate::block::{read_block_header, BlockDecoder, BlockHeader, DataBlock};
use crate::codec::Codec;
use crate::encoding::read_varint_from;
use crate::error::{ContainerError, ContainerErrorKind, Result, SYNC_MARKER_LEN};
use crate::schema::ContainerSchema;
use crate::value::Record;
use gatewire_common::DecodeError;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes at the start of every container file
pub const MAGIC: [u8; 4] = [0x4F, 0x62, 0x6A, 0x01];

/// Header key holding the schema document
pub const SCHEMA_KEY: &str = "container.schema";
/// Header key holding the codec name
pub const CODEC_KEY: &str = "container.codec";

const SCHEMA_KEY_ALIAS: &str = "avro.schema";
const CODEC_KEY_ALIAS: &str = "avro.codec";

/// Upper bound for one header string; anything larger is a corrupt length
const MAX_HEADER_VALUE_LEN: u64 = 16 * 1024 * 1024;

/// Outcome of [`ContainerReader::next_record`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordRead {
    Record(Record),
    /// The previous block is exhausted and the next one has been loaded
    EndOfBlock,
    /// No more complete blocks in the file, for now
    EndOfFile,
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub blocks_read: u64,
    pub records_read: u64,
    /// Stored block bytes, including block headers and sync markers
    pub bytes_read: u64,
}

/// Reads records from one container file.
///
/// The reader owns its file handle and decode buffer. Reaching the end of
/// the data is not final: if the file is still being appended to, calling
/// [`next_record`](Self::next_record) or [`next_block`](Self::next_block)
/// again picks up blocks written since.
pub struct ContainerReader {
    reader: BufReader<File>,
    path: PathBuf,
    schema: Arc<ContainerSchema>,
    codec: Codec,
    metadata: BTreeMap<String, Vec<u8>>,
    sync: [u8; SYNC_MARKER_LEN],
    header_end_pos: u64,
    block: Option<DataBlock>,
    /// Record index of the first record in `block`
    block_first_record: u64,
    /// Record index of the first record in the next unread block
    next_block_first_record: u64,
    stats: ReaderStats,
    last_error: Option<ContainerErrorKind>,
}

impl ContainerReader {
    /// Open a container file and validate its header.
    ///
    /// No block is read until the first record or block is asked for, so a
    /// file whose blocks use an unsupported codec still opens and can be
    /// inspected.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; MAGIC.len()];
        let got = read_fully(&mut reader, &mut magic)?;
        if got < MAGIC.len() || magic != MAGIC {
            return Err(ContainerError::BadMagic(magic[..got].to_vec()));
        }

        let metadata = read_metadata(&mut reader)?;

        let schema_json = lookup(&metadata, SCHEMA_KEY, SCHEMA_KEY_ALIAS)
            .ok_or(ContainerError::MissingSchema)?;
        let schema_json = std::str::from_utf8(schema_json)
            .map_err(|e| ContainerError::SchemaParse(format!("schema is not UTF-8: {e}")))?;
        let schema = Arc::new(ContainerSchema::parse(schema_json)?);

        let codec = match lookup(&metadata, CODEC_KEY, CODEC_KEY_ALIAS) {
            Some(name) => String::from_utf8_lossy(name).parse::<Codec>()?,
            None => Codec::Null,
        };
        if codec == Codec::Snappy {
            warn!(path = %path.display(), "File uses the snappy codec; its blocks cannot be read");
        }

        let mut sync = [0u8; SYNC_MARKER_LEN];
        reader.read_exact(&mut sync)?;
        let header_end_pos = reader.stream_position()?;

        info!(
            path = %path.display(),
            codec = %codec,
            fields = schema.len(),
            header_end_pos,
            "Opened container file"
        );

        Ok(Self {
            reader,
            path,
            schema,
            codec,
            metadata,
            sync,
            header_end_pos,
            block: None,
            block_first_record: 0,
            next_block_first_record: 0,
            stats: ReaderStats::default(),
            last_error: None,
        })
    }

    /// Read the next record.
    ///
    /// When the current block runs out and another block is available, this
    /// returns [`RecordRead::EndOfBlock`] once before the next block's
    /// records.
    pub fn next_record(&mut self) -> Result<RecordRead> {
        let exhausted = match &self.block {
            Some(block) => block.is_exhausted(),
            None => {
                if !self.next_block()? {
                    return Ok(RecordRead::EndOfFile);
                }
                false
            }
        };

        if exhausted {
            return Ok(if self.next_block()? {
                RecordRead::EndOfBlock
            } else {
                RecordRead::EndOfFile
            });
        }

        let result = match self.block.as_mut() {
            Some(block) => block.read_record(&self.schema),
            None => Ok(None),
        };
        match self.track(result)? {
            Some(record) => {
                self.stats.records_read += 1;
                Ok(RecordRead::Record(record))
            }
            None => Ok(RecordRead::EndOfFile),
        }
    }

    /// Load the next block.
    ///
    /// `Ok(false)` means the file ends at a block boundary (or inside a block
    /// header); the position is left at the boundary so a later call can
    /// retry once more data has been written.
    pub fn next_block(&mut self) -> Result<bool> {
        let result = self.load_next_block();
        self.track(result)
    }

    fn load_next_block(&mut self) -> Result<bool> {
        let Some(header) = self.read_header()? else {
            return Ok(false);
        };

        match BlockDecoder::decode(&mut self.reader, header, self.codec, &self.sync) {
            Ok(block) => {
                self.install_block(header, block)?;
                Ok(true)
            }
            Err(err @ ContainerError::TruncatedBlock { .. }) => {
                // A writer may still be appending this block
                self.reader.seek(SeekFrom::Start(header.start_pos))?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn read_header(&mut self) -> Result<Option<BlockHeader>> {
        let start = self.reader.stream_position()?;
        match read_block_header(&mut self.reader, start)? {
            Some(header) => Ok(Some(header)),
            None => {
                self.reader.seek(SeekFrom::Start(start))?;
                debug!(path = %self.path.display(), offset = start, "No more blocks");
                Ok(None)
            }
        }
    }

    fn install_block(&mut self, header: BlockHeader, block: DataBlock) -> Result<()> {
        let next_first = self.records_after(&header)?;
        self.stats.blocks_read += 1;
        self.stats.bytes_read = self
            .stats
            .bytes_read
            .saturating_add(header.end_pos() - header.start_pos);
        self.block_first_record = self.next_block_first_record;
        self.next_block_first_record = next_first;
        self.block = Some(block);
        Ok(())
    }

    /// Index of the first record after the block described by `header`
    fn records_after(&self, header: &BlockHeader) -> Result<u64> {
        self.next_block_first_record
            .checked_add(header.record_count)
            .ok_or(ContainerError::RecordCountOverflow {
                offset: header.start_pos,
            })
    }

    /// Position the reader so the next record returned is the one at
    /// `record_offset` (counting from the first record of the file).
    ///
    /// Blocks before the target are skipped by their declared sizes without
    /// being decoded. Returns `Ok(false)` if the file holds fewer records.
    pub fn seek(&mut self, record_offset: u64) -> Result<bool> {
        let result = self.seek_inner(record_offset);
        self.track(result)
    }

    fn seek_inner(&mut self, record_offset: u64) -> Result<bool> {
        self.rewind_inner()?;

        loop {
            let Some(header) = self.read_header()? else {
                debug!(record_offset, available = self.next_block_first_record, "Seek past end of data");
                return Ok(false);
            };

            let first = self.next_block_first_record;
            let next_first = self.records_after(&header)?;
            if record_offset < next_first {
                let block = BlockDecoder::decode(&mut self.reader, header, self.codec, &self.sync)?;
                self.install_block(header, block)?;
                if let Some(block) = self.block.as_mut() {
                    block.skip_records(&self.schema, record_offset - first)?;
                }
                debug!(record_offset, block_offset = header.start_pos, "Seek complete");
                return Ok(true);
            }

            self.next_block_first_record = next_first;
            self.reader.seek(SeekFrom::Start(header.end_pos()))?;
        }
    }

    /// Go back to the first block without loading it
    pub fn rewind(&mut self) -> Result<()> {
        let result = self.rewind_inner();
        self.track(result)
    }

    fn rewind_inner(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(self.header_end_pos))?;
        self.block = None;
        self.block_first_record = 0;
        self.next_block_first_record = 0;
        Ok(())
    }

    /// Read the next block as stored in the file, without decoding it.
    ///
    /// Any partially read current block is abandoned.
    pub fn next_raw_block(&mut self) -> Result<Option<Vec<u8>>> {
        let result = self.read_raw_block();
        self.track(result)
    }

    fn read_raw_block(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };
        let next_first = self.records_after(&header)?;

        let raw = match BlockDecoder::read_raw(&mut self.reader, header, &self.sync) {
            Ok(raw) => raw,
            Err(err @ ContainerError::TruncatedBlock { .. }) => {
                self.reader.seek(SeekFrom::Start(header.start_pos))?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.stats.blocks_read += 1;
        self.stats.bytes_read += raw.len() as u64;
        self.block = None;
        self.block_first_record = self.next_block_first_record;
        self.next_block_first_record = next_first;
        Ok(Some(raw))
    }

    /// The file header bytes: magic, metadata map and sync marker
    pub fn binary_header(&mut self) -> Result<Vec<u8>> {
        let result = self.read_binary_header();
        self.track(result)
    }

    fn read_binary_header(&mut self) -> Result<Vec<u8>> {
        let saved = self.reader.stream_position()?;
        self.reader.seek(SeekFrom::Start(0))?;
        let mut header = vec![0u8; self.header_end_pos as usize];
        self.reader.read_exact(&mut header)?;
        self.reader.seek(SeekFrom::Start(saved))?;
        Ok(header)
    }

    /// Iterate over the remaining records, skipping block boundaries
    pub fn records(&mut self) -> Records<'_> {
        Records {
            reader: self,
            done: false,
        }
    }

    /// Record index of the next record to be returned
    pub fn record_position(&self) -> u64 {
        match &self.block {
            Some(block) => self.block_first_record + block.records_read(),
            None => self.next_block_first_record,
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.metadata
    }

    pub fn schema(&self) -> &Arc<ContainerSchema> {
        &self.schema
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn sync_marker(&self) -> &[u8; SYNC_MARKER_LEN] {
        &self.sync
    }

    /// File offset of the first data block
    pub fn header_end_pos(&self) -> u64 {
        self.header_end_pos
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Most recent failure; not cleared by later successful calls
    pub fn last_error(&self) -> Option<ContainerErrorKind> {
        self.last_error
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored payload size of the current block
    pub fn block_size(&self) -> Option<u64> {
        self.block.as_ref().map(DataBlock::byte_count)
    }

    /// Release the file handle and decode buffer
    pub fn close(self) -> ReaderStats {
        debug!(
            path = %self.path.display(),
            blocks = self.stats.blocks_read,
            records = self.stats.records_read,
            "Closed container file"
        );
        self.stats
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            warn!(path = %self.path.display(), error = %err, "Container read failed");
            self.last_error = Some(err.kind());
        }
        result
    }
}

/// Iterator returned by [`ContainerReader::records`].
///
/// Stops at the end of the available data or after the first error.
pub struct Records<'a> {
    reader: &'a mut ContainerReader,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.next_record() {
                Ok(RecordRead::Record(record)) => return Some(Ok(record)),
                Ok(RecordRead::EndOfBlock) => continue,
                Ok(RecordRead::EndOfFile) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for Records<'_> {}

fn lookup<'a>(metadata: &'a BTreeMap<String, Vec<u8>>, key: &str, alias: &str) -> Option<&'a [u8]> {
    metadata
        .get(key)
        .or_else(|| metadata.get(alias))
        .map(Vec::as_slice)
}

/// Read the header map: blocks of key/value pairs, each block prefixed by
/// its entry count (negative when followed by a byte size), ended by a
/// zero count.
fn read_metadata<R: Read>(reader: &mut R) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut metadata = BTreeMap::new();

    loop {
        let count = read_header_long(reader)?;
        if count == 0 {
            break;
        }
        if count < 0 {
            let _block_size = read_header_long(reader)?;
        }

        for _ in 0..count.unsigned_abs() {
            let key = String::from_utf8_lossy(&read_header_bytes(reader)?).into_owned();
            let value = read_header_bytes(reader)?;
            debug!(key = %key, len = value.len(), "Header entry");
            metadata.insert(key, value);
        }
    }

    Ok(metadata)
}

fn read_header_long<R: Read>(reader: &mut R) -> Result<i64> {
    match read_varint_from(reader) {
        Ok(Some((value, _))) => Ok(value),
        Ok(None) => Err(io::Error::new(ErrorKind::UnexpectedEof, "file header ends early").into()),
        Err(e) if e.kind() == ErrorKind::InvalidData => Err(DecodeError::VarintOverflow(0).into()),
        Err(e) => Err(e.into()),
    }
}

fn read_header_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_header_long(reader)?;
    if len < 0 {
        return Err(DecodeError::NegativeLength { offset: 0, length: len }.into());
    }
    let len = len as u64;
    if len > MAX_HEADER_VALUE_LEN {
        return Err(ContainerError::invalid_value(
            "metadata",
            format!("header value of {len} bytes"),
        ));
    }

    let mut value = Vec::with_capacity(len as usize);
    reader.take(len).read_to_end(&mut value)?;
    if (value.len() as u64) < len {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "file header ends early").into());
    }
    Ok(value)
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{write_varint_bytes, write_varint_long, write_varint_string};
    use std::io::{Cursor, Write};

    fn header_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = MAGIC.to_vec();
        write_varint_long(&mut buf, entries.len() as i64);
        for (k, v) in entries {
            write_varint_string(&mut buf, k);
            write_varint_bytes(&mut buf, v);
        }
        write_varint_long(&mut buf, 0);
        buf.extend_from_slice(&[0x11; SYNC_MARKER_LEN]);
        buf
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    const SCHEMA: &str = r#"{"type":"record","name":"T","fields":[{"name":"id","type":"long"}]}"#;

    #[test]
    fn test_open_header_only_file() {
        let file = write_temp(&header_with(&[(SCHEMA_KEY, SCHEMA.as_bytes())]));
        let mut reader = ContainerReader::open(file.path()).unwrap();

        assert_eq!(reader.codec(), Codec::Null);
        assert_eq!(reader.sync_marker(), &[0x11; SYNC_MARKER_LEN]);
        assert_eq!(reader.header_end_pos(), std::fs::metadata(file.path()).unwrap().len());
        assert_eq!(reader.next_record().unwrap(), RecordRead::EndOfFile);
        assert!(reader.last_error().is_none());
        assert_eq!(reader.binary_header().unwrap().len() as u64, reader.header_end_pos());
    }

    #[test]
    fn test_avro_aliases_accepted() {
        let file = write_temp(&header_with(&[
            ("avro.schema", SCHEMA.as_bytes()),
            ("avro.codec", b"deflate"),
        ]));
        let reader = ContainerReader::open(file.path()).unwrap();
        assert_eq!(reader.codec(), Codec::Deflate);
        assert_eq!(reader.schema().name(), Some("T"));
    }

    #[test]
    fn test_bad_magic() {
        let file = write_temp(b"PK\x03\x04rest");
        assert!(matches!(
            ContainerReader::open(file.path()),
            Err(ContainerError::BadMagic(ref m)) if m == b"PK\x03\x04"
        ));

        let short = write_temp(b"Ob");
        assert!(matches!(
            ContainerReader::open(short.path()),
            Err(ContainerError::BadMagic(_))
        ));
    }

    #[test]
    fn test_missing_schema() {
        let file = write_temp(&header_with(&[(CODEC_KEY, b"null")]));
        assert!(matches!(
            ContainerReader::open(file.path()),
            Err(ContainerError::MissingSchema)
        ));
    }

    #[test]
    fn test_unknown_codec_rejected_at_open() {
        let file = write_temp(&header_with(&[
            (SCHEMA_KEY, SCHEMA.as_bytes()),
            (CODEC_KEY, b"lz4"),
        ]));
        assert!(matches!(
            ContainerReader::open(file.path()),
            Err(ContainerError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_snappy_accepted_at_open() {
        let file = write_temp(&header_with(&[
            (SCHEMA_KEY, SCHEMA.as_bytes()),
            (CODEC_KEY, b"snappy"),
        ]));
        let reader = ContainerReader::open(file.path()).unwrap();
        assert_eq!(reader.codec(), Codec::Snappy);
    }

    #[test]
    fn test_snappy_file_with_blocks_fails_on_first_read() {
        let mut bytes = header_with(&[
            (SCHEMA_KEY, SCHEMA.as_bytes()),
            (CODEC_KEY, b"snappy"),
        ]);
        write_varint_long(&mut bytes, 1);
        write_varint_long(&mut bytes, 3);
        bytes.extend_from_slice(b"xyz");
        bytes.extend_from_slice(&[0x11; SYNC_MARKER_LEN]);
        let file = write_temp(&bytes);

        let mut reader = ContainerReader::open(file.path()).unwrap();
        assert_eq!(reader.metadata()[CODEC_KEY], b"snappy");
        assert_eq!(reader.record_position(), 0);
        assert!(reader.block_size().is_none());

        assert!(matches!(
            reader.next_record(),
            Err(ContainerError::UnsupportedCodec(_))
        ));
        assert_eq!(reader.last_error(), Some(ContainerErrorKind::UnsupportedCodec));

        // Raw blocks need no decompression
        reader.rewind().unwrap();
        assert_eq!(reader.next_raw_block().unwrap().map(|b| b.len()), Some(2 + 3 + SYNC_MARKER_LEN));
    }

    #[test]
    fn test_record_counts_overflowing_the_index_are_corrupt() {
        let mut bytes = header_with(&[(SCHEMA_KEY, SCHEMA.as_bytes())]);
        for _ in 0..3 {
            write_varint_long(&mut bytes, i64::MAX);
            write_varint_long(&mut bytes, 0);
            bytes.extend_from_slice(&[0x11; SYNC_MARKER_LEN]);
        }
        let file = write_temp(&bytes);
        let mut reader = ContainerReader::open(file.path()).unwrap();

        let err = reader.seek(u64::MAX).unwrap_err();
        assert!(matches!(err, ContainerError::RecordCountOverflow { .. }));
        assert!(err.is_corruption());
        assert_eq!(reader.last_error(), Some(ContainerErrorKind::RecordCountOverflow));

        reader.rewind().unwrap();
        assert!(reader.next_raw_block().unwrap().is_some());
        assert!(reader.next_raw_block().unwrap().is_some());
        assert!(matches!(
            reader.next_raw_block(),
            Err(ContainerError::RecordCountOverflow { .. })
        ));
    }

    #[test]
    fn test_metadata_block_with_byte_size() {
        let mut buf = Vec::new();
        let mut entries = Vec::new();
        write_varint_string(&mut entries, SCHEMA_KEY);
        write_varint_bytes(&mut entries, SCHEMA.as_bytes());
        write_varint_long(&mut buf, -1);
        write_varint_long(&mut buf, entries.len() as i64);
        buf.extend_from_slice(&entries);
        write_varint_long(&mut buf, 0);

        let metadata = read_metadata(&mut Cursor::new(buf)).unwrap();
        assert_eq!(metadata[SCHEMA_KEY], SCHEMA.as_bytes());
    }

    #[test]
    fn test_truncated_header() {
        let full = header_with(&[(SCHEMA_KEY, SCHEMA.as_bytes())]);
        let file = write_temp(&full[..20]);
        assert!(matches!(
            ContainerReader::open(file.path()),
            Err(ContainerError::Io(ref e)) if e.kind() == ErrorKind::UnexpectedEof
        ));
    }
}
