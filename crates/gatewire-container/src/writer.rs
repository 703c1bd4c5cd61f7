//! Container file writer

use crate::codec::Codec;
use crate::encoding::{encode_record, write_varint_bytes, write_varint_long, write_varint_string};
use crate::error::{ContainerError, Result, SYNC_MARKER_LEN};
use crate::reader::{CODEC_KEY, MAGIC, SCHEMA_KEY};
use crate::schema::ContainerSchema;
use crate::value::Record;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_BLOCK_RECORDS: u64 = 1000;
pub const DEFAULT_BLOCK_BYTES: usize = 64 * 1024;

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub blocks_written: u64,
    pub records_written: u64,
    pub bytes_written: u64,
}

/// Appends records to a new container file.
///
/// Records are buffered into a block and written once the block reaches
/// its record or byte limit, or on [`flush_block`](Self::flush_block).
/// Every written block is flushed to the file so a concurrent reader sees
/// whole blocks only.
pub struct ContainerWriter {
    out: BufWriter<File>,
    path: PathBuf,
    schema: ContainerSchema,
    codec: Codec,
    sync: [u8; SYNC_MARKER_LEN],
    pending: Vec<u8>,
    pending_records: u64,
    max_block_records: u64,
    max_block_bytes: usize,
    stats: WriterStats,
}

impl ContainerWriter {
    /// Create (or truncate) `path` and write the file header
    pub fn create(path: impl AsRef<Path>, schema: &ContainerSchema, codec: Codec) -> Result<Self> {
        if codec == Codec::Snappy {
            return Err(ContainerError::UnsupportedCodec(codec.as_str().into()));
        }

        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        let sync = *Uuid::new_v4().as_bytes();

        let mut header = MAGIC.to_vec();
        write_varint_long(&mut header, 2);
        write_varint_string(&mut header, SCHEMA_KEY);
        write_varint_bytes(&mut header, schema.to_json().as_bytes());
        write_varint_string(&mut header, CODEC_KEY);
        write_varint_bytes(&mut header, codec.as_str().as_bytes());
        write_varint_long(&mut header, 0);
        header.extend_from_slice(&sync);

        out.write_all(&header)?;
        out.flush()?;

        info!(path = %path.display(), codec = %codec, "Created container file");

        Ok(Self {
            out,
            path,
            schema: schema.clone(),
            codec,
            sync,
            pending: Vec::new(),
            pending_records: 0,
            max_block_records: DEFAULT_BLOCK_RECORDS,
            max_block_bytes: DEFAULT_BLOCK_BYTES,
            stats: WriterStats {
                bytes_written: header.len() as u64,
                ..WriterStats::default()
            },
        })
    }

    /// Limits at which a pending block is written out
    pub fn with_block_limits(mut self, max_records: u64, max_bytes: usize) -> Self {
        self.max_block_records = max_records.max(1);
        self.max_block_bytes = max_bytes.max(1);
        self
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        let start = self.pending.len();
        if let Err(err) = encode_record(&mut self.pending, &self.schema, record) {
            self.pending.truncate(start);
            return Err(err);
        }
        self.pending_records += 1;

        if self.pending_records >= self.max_block_records || self.pending.len() >= self.max_block_bytes {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Write any pending records as one block
    pub fn flush_block(&mut self) -> Result<()> {
        if self.pending_records == 0 {
            return Ok(());
        }

        let payload = self.codec.compress(&self.pending)?;
        let mut block = Vec::with_capacity(payload.len() + 20 + SYNC_MARKER_LEN);
        write_varint_long(&mut block, self.pending_records as i64);
        write_varint_long(&mut block, payload.len() as i64);
        block.extend_from_slice(&payload);
        block.extend_from_slice(&self.sync);

        self.out.write_all(&block)?;
        self.out.flush()?;

        debug!(
            path = %self.path.display(),
            records = self.pending_records,
            bytes = block.len(),
            "Wrote block"
        );

        self.stats.blocks_written += 1;
        self.stats.records_written += self.pending_records;
        self.stats.bytes_written += block.len() as u64;
        self.pending.clear();
        self.pending_records = 0;
        Ok(())
    }

    /// Write the final block and close the file
    pub fn finish(mut self) -> Result<WriterStats> {
        self.flush_block()?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.stats)
    }

    pub fn sync_marker(&self) -> &[u8; SYNC_MARKER_LEN] {
        &self.sync
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{ContainerReader, RecordRead};
    use crate::schema::{Field, FieldType};
    use crate::value::Value;

    fn schema() -> ContainerSchema {
        ContainerSchema::from_fields("Row", vec![Field::new("id", FieldType::Int)])
    }

    #[test]
    fn test_block_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.cnt");

        let mut writer = ContainerWriter::create(&path, &schema(), Codec::Null)
            .unwrap()
            .with_block_limits(2, usize::MAX);
        for i in 0..5 {
            writer.append(&Record::new().with("id", Value::Int(i))).unwrap();
        }
        assert_eq!(writer.stats().blocks_written, 2);
        let stats = writer.finish().unwrap();
        assert_eq!(stats.blocks_written, 3);
        assert_eq!(stats.records_written, 5);
        assert_eq!(stats.bytes_written, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_sync_marker_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.cnt");

        let writer = ContainerWriter::create(&path, &schema(), Codec::Deflate).unwrap();
        let sync = *writer.sync_marker();
        writer.finish().unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.sync_marker(), &sync);
        assert_eq!(reader.codec(), Codec::Deflate);
        assert_eq!(reader.next_record().unwrap(), RecordRead::EndOfFile);
    }

    #[test]
    fn test_snappy_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ContainerWriter::create(dir.path().join("x.cnt"), &schema(), Codec::Snappy),
            Err(ContainerError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_append_rejects_mismatched_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ContainerWriter::create(dir.path().join("bad.cnt"), &schema(), Codec::Null).unwrap();
        let err = writer
            .append(&Record::new().with("id", Value::String("nope".into())))
            .unwrap_err();
        assert!(matches!(err, ContainerError::InvalidValue { .. }));
    }
}
