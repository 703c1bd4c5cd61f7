//! Block compression codecs

use crate::error::{ContainerError, Result};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use tracing::trace;

/// Compression applied to each block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Null,
    Deflate,
    /// Recognized in headers, but blocks using it cannot be read
    Snappy,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Null => "null",
            Codec::Deflate => "deflate",
            Codec::Snappy => "snappy",
        }
    }

    /// Decompress one block payload
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Null => Ok(input.to_vec()),
            Codec::Deflate => inflate(input),
            Codec::Snappy => Err(ContainerError::UnsupportedCodec(self.as_str().into())),
        }
    }

    /// Compress one block payload
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Null => Ok(input.to_vec()),
            Codec::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(input)?;
                Ok(encoder.finish()?)
            }
            Codec::Snappy => Err(ContainerError::UnsupportedCodec(self.as_str().into())),
        }
    }
}

impl FromStr for Codec {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "null" => Ok(Codec::Null),
            "deflate" => Ok(Codec::Deflate),
            "snappy" => Ok(Codec::Snappy),
            other => Err(ContainerError::UnsupportedCodec(other.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inflate a raw deflate stream (no zlib header).
///
/// The output buffer starts at twice the input size and doubles whenever
/// the decompressor fills it, until the stream ends.
fn inflate(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = Decompress::new(false);
    let mut output = Vec::with_capacity(input.len().saturating_mul(2).max(64));

    loop {
        let consumed = decoder.total_in() as usize;
        let produced_before = decoder.total_out();

        let status = decoder
            .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Finish)
            .map_err(|e| ContainerError::Decompression(e.to_string()))?;

        match status {
            Status::StreamEnd => return Ok(output),
            Status::Ok | Status::BufError => {
                if output.len() == output.capacity() {
                    let grow = output.capacity().max(64);
                    trace!("Growing inflate buffer to {} bytes", output.capacity() + grow);
                    output.reserve(grow);
                } else if decoder.total_in() as usize == consumed
                    && decoder.total_out() == produced_before
                {
                    // Space left, no progress: the input ended before the stream did
                    return Err(ContainerError::Decompression(format!(
                        "deflate stream ended early after {} of {} bytes",
                        consumed,
                        input.len()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_names() {
        assert_eq!("null".parse::<Codec>().unwrap(), Codec::Null);
        assert_eq!("deflate".parse::<Codec>().unwrap(), Codec::Deflate);
        assert_eq!("snappy".parse::<Codec>().unwrap(), Codec::Snappy);
        assert!(matches!(
            "zstd".parse::<Codec>(),
            Err(ContainerError::UnsupportedCodec(ref name)) if name == "zstd"
        ));
        assert_eq!(Codec::default(), Codec::Null);
    }

    #[test]
    fn test_deflate_round_trip() {
        let input: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let compressed = Codec::Deflate.compress(&input).unwrap();
        assert_eq!(Codec::Deflate.decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_inflate_grows_buffer_for_high_ratios() {
        // 1MB of zeros compresses to about a kilobyte; the first 2x estimate
        // is far too small
        let input = vec![0u8; 1024 * 1024];
        let compressed = Codec::Deflate.compress(&input).unwrap();
        assert!(compressed.len() * 2 < input.len());
        assert_eq!(Codec::Deflate.decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_truncated_deflate_stream() {
        let input = vec![7u8; 4096];
        let compressed = Codec::Deflate.compress(&input).unwrap();
        let err = Codec::Deflate
            .decompress(&compressed[..compressed.len() / 2])
            .unwrap_err();
        assert!(matches!(err, ContainerError::Decompression(_)));
    }

    #[test]
    fn test_garbage_deflate_stream() {
        let err = Codec::Deflate.decompress(&[0xFF; 32]).unwrap_err();
        assert!(matches!(err, ContainerError::Decompression(_)));
    }

    #[test]
    fn test_snappy_fails_at_block_time() {
        assert!(matches!(
            Codec::Snappy.decompress(b"abc"),
            Err(ContainerError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_null_codec_copies() {
        assert_eq!(Codec::Null.decompress(b"abc").unwrap(), b"abc");
    }
}
