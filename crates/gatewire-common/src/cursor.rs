//! Forward-only, bounds-checked reader over a byte slice
//!
//! Used by both the wire protocol code (length-encoded integers, fixed
//! little-endian fields) and the container format (zig-zag varints and
//! varint-prefixed strings). Every read either advances past exactly the
//! bytes it consumed or fails without moving.

use crate::error::DecodeError;

/// Longest legal zig-zag varint for a 64-bit value
const MAX_VARINT_LEN: usize = 10;

/// Forward-only view over a byte buffer
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Create a cursor positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset from the start of the buffer
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::UnexpectedEnd {
                offset: self.pos,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.data[self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Borrow the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Borrow everything that is left
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.ensure(len)?;
        self.pos += len;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u24_le(&mut self) -> Result<u32, DecodeError> {
        let b: [u8; 3] = self.read_array()?;
        Ok(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64_le(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Read a protocol length-encoded integer
    ///
    /// `0x00..=0xFA` is the value itself, `0xFC`/`0xFD`/`0xFE` prefix a 2, 3
    /// or 8 byte little-endian value. `0xFB` (NULL) and `0xFF` are rejected.
    pub fn read_lenenc_int(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let first = self.peek_u8()?;
        let value = match first {
            0..=0xFA => {
                self.pos += 1;
                return Ok(u64::from(first));
            }
            0xFC => {
                self.ensure(3)?;
                self.pos += 1;
                u64::from(self.read_u16_le()?)
            }
            0xFD => {
                self.ensure(4)?;
                self.pos += 1;
                u64::from(self.read_u24_le()?)
            }
            0xFE => {
                self.ensure(9)?;
                self.pos += 1;
                self.read_u64_le()?
            }
            prefix => {
                return Err(DecodeError::InvalidLenenc {
                    offset: start,
                    prefix,
                })
            }
        };
        Ok(value)
    }

    /// Skip over a length-encoded integer without interpreting it
    pub fn skip_lenenc_int(&mut self) -> Result<(), DecodeError> {
        let width = match self.peek_u8()? {
            0xFC => 3,
            0xFD => 4,
            0xFE => 9,
            _ => 1,
        };
        self.skip(width)
    }

    /// Read a zig-zag encoded variable-length 64-bit integer
    pub fn read_varint_long(&mut self) -> Result<i64, DecodeError> {
        let start = self.pos;
        let mut raw: u64 = 0;
        let mut shift = 0;

        for i in 0..MAX_VARINT_LEN {
            let b = match self.data.get(start + i) {
                Some(b) => *b,
                None => {
                    return Err(DecodeError::UnexpectedEnd {
                        offset: start,
                        needed: i + 1,
                        remaining: self.data.len().saturating_sub(start),
                    })
                }
            };
            raw |= u64::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                self.pos = start + i + 1;
                return Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64));
            }
            shift += 7;
        }

        Err(DecodeError::VarintOverflow(start))
    }

    /// Read a zig-zag varint that must fit into 32 bits
    pub fn read_varint_int(&mut self) -> Result<i32, DecodeError> {
        let start = self.pos;
        let value = self.read_varint_long()?;
        i32::try_from(value).map_err(|_| {
            self.pos = start;
            DecodeError::VarintOverflow(start)
        })
    }

    /// Read a varint length prefix followed by that many bytes
    pub fn read_varint_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        let len = self.read_varint_long()?;
        if len < 0 {
            self.pos = start;
            return Err(DecodeError::NegativeLength {
                offset: start,
                length: len,
            });
        }
        match self.read_bytes(len as usize) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Read a varint-prefixed UTF-8 string
    pub fn read_varint_string(&mut self) -> Result<&'a str, DecodeError> {
        let start = self.pos;
        let bytes = self.read_varint_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| {
            self.pos = start;
            DecodeError::InvalidUtf8(start)
        })
    }
}
