//! Container file inspection
//!
//! Backs the `dump` and `schema` subcommands. Output is one JSON document
//! per line so it can be piped into other tools.

use anyhow::{Context, Result};
use gatewire_container::ContainerReader;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Write every record from `offset` on as a JSON line. Returns the number
/// of records written.
pub fn dump_records(path: &Path, offset: Option<u64>, out: &mut impl Write) -> Result<u64> {
    let mut reader = ContainerReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    if let Some(offset) = offset {
        if !reader.seek(offset)? {
            warn!("Offset {} is past the last record of {}", offset, path.display());
            return Ok(0);
        }
    }

    let mut written = 0;
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::to_writer(&mut *out, &record.to_json())?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;

    let stats = reader.close();
    debug!(
        blocks = stats.blocks_read,
        records = stats.records_read,
        bytes = stats.bytes_read,
        "Dump finished"
    );
    Ok(written)
}

/// Write each block, still encoded, as a JSON line with its bytes in hex.
/// The header is the first line so the output describes the whole file.
pub fn dump_raw_blocks(path: &Path, out: &mut impl Write) -> Result<u64> {
    let mut reader = ContainerReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let header = reader.binary_header()?;
    serde_json::to_writer(
        &mut *out,
        &json!({ "header": true, "length": header.len(), "bytes": hex(&header) }),
    )?;
    out.write_all(b"\n")?;

    reader.rewind()?;
    let mut blocks = 0;
    while let Some(block) = reader.next_raw_block()? {
        serde_json::to_writer(
            &mut *out,
            &json!({ "block": blocks, "length": block.len(), "bytes": hex(&block) }),
        )?;
        out.write_all(b"\n")?;
        blocks += 1;
    }
    out.flush()?;
    Ok(blocks)
}

/// Describe the file header: schema, codec, sync marker and metadata keys
pub fn print_schema(path: &Path, out: &mut impl Write) -> Result<()> {
    let reader = ContainerReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let schema: serde_json::Value = serde_json::from_str(reader.schema().to_json())
        .context("schema is not valid JSON")?;
    let description = json!({
        "schema": schema,
        "codec": reader.codec().as_str(),
        "sync": hex(reader.sync_marker()),
        "header_end": reader.header_end_pos(),
        "metadata_keys": reader.metadata().keys().collect::<Vec<_>>(),
    });

    serde_json::to_writer_pretty(&mut *out, &description)?;
    out.write_all(b"\n")?;
    Ok(())
}
