//! Gatewire container files
//!
//! Block-structured, schema-described binary files used to store change
//! records. A file is a magic number, a metadata map carrying the record
//! schema and codec, a 16-byte sync marker, then any number of blocks of
//! encoded records each terminated by the sync marker.

pub mod block;
pub mod codec;
pub mod encoding;
pub mod error;
pub mod reader;
pub mod schema;
pub mod value;
pub mod writer;

pub use block::{BlockDecoder, BlockHeader, DataBlock};
pub use codec::Codec;
pub use error::{ContainerError, ContainerErrorKind, Result, SyncMismatchKind, SYNC_MARKER_LEN};
pub use reader::{ContainerReader, ReaderStats, RecordRead, Records};
pub use schema::{ContainerSchema, Field, FieldExtra, FieldType};
pub use value::{Record, Value};
pub use writer::{ContainerWriter, WriterStats};
