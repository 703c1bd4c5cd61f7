//! Binary encoding of header maps and record fields
//!
//! Integers are zig-zag encoded base-128 varints; strings and byte arrays are
//! a varint length followed by the raw bytes. Floats are little-endian IEEE
//! 754. Unions carry a varint branch index before the value.

use crate::error::{ContainerError, Result};
use crate::schema::{ContainerSchema, Field, FieldType};
use crate::value::{Record, Value};
use gatewire_common::ByteCursor;
use std::io::{self, ErrorKind, Read};

/// Longest varint encoding of a 64-bit value
const MAX_VARINT_LEN: usize = 10;

pub fn write_varint_long(buf: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n >= 0x80 {
        buf.push((n as u8 & 0x7F) | 0x80);
        n >>= 7;
    }
    buf.push(n as u8);
}

pub fn write_varint_int(buf: &mut Vec<u8>, value: i32) {
    write_varint_long(buf, i64::from(value));
}

pub fn write_varint_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint_long(buf, bytes.len() as i64);
    buf.extend_from_slice(bytes);
}

pub fn write_varint_string(buf: &mut Vec<u8>, s: &str) {
    write_varint_bytes(buf, s.as_bytes());
}

/// Read one varint from a stream.
///
/// Returns the decoded value and the number of bytes consumed, or `None`
/// when the stream ends before the first byte. Ending in the middle of a
/// varint is an `UnexpectedEof` error.
pub fn read_varint_from<R: Read>(reader: &mut R) -> io::Result<Option<(i64, usize)>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let mut n = u64::from(byte[0] & 0x7F);
    let mut len = 1;
    while byte[0] & 0x80 != 0 {
        if len == MAX_VARINT_LEN {
            return Err(io::Error::new(ErrorKind::InvalidData, "varint is too long"));
        }
        reader.read_exact(&mut byte)?;
        n |= u64::from(byte[0] & 0x7F) << (7 * len);
        len += 1;
    }

    Ok(Some((zigzag_decode(n), len)))
}

fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Decode one record laid out in schema field order
pub fn decode_record(cursor: &mut ByteCursor<'_>, schema: &ContainerSchema) -> Result<Record> {
    let mut record = Record::with_capacity(schema.len());
    for field in schema.fields() {
        let value = decode_field(cursor, field)?;
        record.push(field.name.clone(), value);
    }
    Ok(record)
}

fn decode_field(cursor: &mut ByteCursor<'_>, field: &Field) -> Result<Value> {
    match field.field_type {
        FieldType::Enum => {
            let index = cursor.read_varint_int()?;
            let symbol = field
                .symbols()
                .and_then(|s| usize::try_from(index).ok().and_then(|i| s.get(i)))
                .ok_or_else(|| {
                    ContainerError::invalid_value(
                        &field.name,
                        format!("enum index {} has no symbol", index),
                    )
                })?;
            Ok(Value::Enum {
                index,
                symbol: symbol.clone(),
            })
        }

        FieldType::Union => {
            let branch = cursor.read_varint_long()?;
            let branch_type = field
                .branches()
                .and_then(|b| usize::try_from(branch).ok().and_then(|i| b.get(i)))
                .copied()
                .ok_or_else(|| {
                    ContainerError::invalid_value(
                        &field.name,
                        format!("union branch {} does not exist", branch),
                    )
                })?;
            decode_primitive(cursor, &field.name, branch_type)
        }

        primitive => decode_primitive(cursor, &field.name, primitive),
    }
}

fn decode_primitive(cursor: &mut ByteCursor<'_>, name: &str, field_type: FieldType) -> Result<Value> {
    let value = match field_type {
        FieldType::Null => Value::Null,
        FieldType::Boolean => Value::Boolean(cursor.read_u8()? != 0),
        FieldType::Int => Value::Int(cursor.read_varint_int()?),
        FieldType::Long => Value::Long(cursor.read_varint_long()?),
        FieldType::Float => Value::Float(cursor.read_f32_le()?),
        FieldType::Double => Value::Double(cursor.read_f64_le()?),
        FieldType::String => Value::String(cursor.read_varint_string()?.to_string()),
        FieldType::Bytes => Value::Bytes(cursor.read_varint_bytes()?.to_vec()),
        FieldType::Enum | FieldType::Union | FieldType::Unknown => {
            return Err(ContainerError::UnsupportedType {
                field: name.to_string(),
            })
        }
    };
    Ok(value)
}

/// Encode a record in schema field order. Fields missing from the record
/// are written as null, which only nullable fields accept.
pub fn encode_record(buf: &mut Vec<u8>, schema: &ContainerSchema, record: &Record) -> Result<()> {
    for field in schema.fields() {
        let value = record.get(&field.name).unwrap_or(&Value::Null);
        encode_field(buf, field, value)?;
    }
    Ok(())
}

fn encode_field(buf: &mut Vec<u8>, field: &Field, value: &Value) -> Result<()> {
    match field.field_type {
        FieldType::Enum => {
            let symbols = field.symbols().unwrap_or_default();
            let index = match value {
                Value::Enum { symbol, .. } | Value::String(symbol) => {
                    symbols.iter().position(|s| s == symbol)
                }
                Value::Int(i) => usize::try_from(*i).ok().filter(|i| *i < symbols.len()),
                _ => None,
            };
            let index = index.ok_or_else(|| {
                ContainerError::invalid_value(
                    &field.name,
                    format!("{} value is not one of the enum symbols", value.type_name()),
                )
            })?;
            write_varint_long(buf, index as i64);
            Ok(())
        }

        FieldType::Union => {
            let branches = field.branches().unwrap_or_default();
            let branch = branches
                .iter()
                .position(|b| accepts(*b, value))
                .ok_or_else(|| {
                    ContainerError::invalid_value(
                        &field.name,
                        format!("no union branch accepts a {} value", value.type_name()),
                    )
                })?;
            write_varint_long(buf, branch as i64);
            encode_primitive(buf, &field.name, branches[branch], value)
        }

        primitive => encode_primitive(buf, &field.name, primitive, value),
    }
}

fn accepts(field_type: FieldType, value: &Value) -> bool {
    matches!(
        (field_type, value),
        (FieldType::Null, Value::Null)
            | (FieldType::Boolean, Value::Boolean(_))
            | (FieldType::Int, Value::Int(_))
            | (FieldType::Long, Value::Long(_) | Value::Int(_))
            | (FieldType::Float, Value::Float(_))
            | (FieldType::Double, Value::Double(_) | Value::Float(_))
            | (FieldType::String, Value::String(_))
            | (FieldType::Bytes, Value::Bytes(_))
    )
}

fn encode_primitive(buf: &mut Vec<u8>, name: &str, field_type: FieldType, value: &Value) -> Result<()> {
    match (field_type, value) {
        (FieldType::Null, Value::Null) => {}
        (FieldType::Boolean, Value::Boolean(b)) => buf.push(u8::from(*b)),
        (FieldType::Int, Value::Int(v)) => write_varint_int(buf, *v),
        (FieldType::Long, Value::Long(v)) => write_varint_long(buf, *v),
        (FieldType::Long, Value::Int(v)) => write_varint_long(buf, i64::from(*v)),
        (FieldType::Float, Value::Float(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (FieldType::Double, Value::Double(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (FieldType::Double, Value::Float(v)) => {
            buf.extend_from_slice(&f64::from(*v).to_le_bytes())
        }
        (FieldType::String, Value::String(s)) => write_varint_string(buf, s),
        (FieldType::Bytes, Value::Bytes(b)) => write_varint_bytes(buf, b),
        (FieldType::Unknown, _) => {
            return Err(ContainerError::UnsupportedType {
                field: name.to_string(),
            })
        }
        (expected, value) => {
            return Err(ContainerError::invalid_value(
                name,
                format!("expected {}, got {}", expected, value.type_name()),
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldExtra;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn sample_schema() -> ContainerSchema {
        ContainerSchema::parse(
            r#"{"type": "record", "name": "Row", "fields": [
                {"name": "id", "type": "long"},
                {"name": "flag", "type": "boolean"},
                {"name": "ratio", "type": "double"},
                {"name": "name", "type": "string"},
                {"name": "blob", "type": "bytes"},
                {"name": "kind", "type": {"type": "enum", "name": "Kind", "symbols": ["a", "b"]}},
                {"name": "note", "type": ["null", "string"]}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_known_varint_encodings() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (-64, &[0x7F]),
            (64, &[0x80, 0x01]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            write_varint_long(&mut buf, *value);
            assert_eq!(buf.as_slice(), *expected, "encoding of {}", value);
        }
    }

    #[test]
    fn test_read_varint_from_stream() {
        let mut buf = Vec::new();
        write_varint_long(&mut buf, 300);
        write_varint_long(&mut buf, -2);
        let mut stream = Cursor::new(buf);

        assert_eq!(read_varint_from(&mut stream).unwrap(), Some((300, 2)));
        assert_eq!(read_varint_from(&mut stream).unwrap(), Some((-2, 1)));
        assert_eq!(read_varint_from(&mut stream).unwrap(), None);
    }

    #[test]
    fn test_read_varint_from_truncated_stream() {
        let mut stream = Cursor::new(vec![0x80]);
        let err = read_varint_from(&mut stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_record_round_trip() {
        let schema = sample_schema();
        let record = Record::new()
            .with("id", Value::Long(-12345))
            .with("flag", Value::Boolean(true))
            .with("ratio", Value::Double(2.5))
            .with("name", Value::String("gatewire".into()))
            .with("blob", Value::Bytes(vec![0, 1, 2]))
            .with(
                "kind",
                Value::Enum {
                    index: 1,
                    symbol: "b".into(),
                },
            )
            .with("note", Value::Null);

        let mut buf = Vec::new();
        encode_record(&mut buf, &schema, &record).unwrap();
        let mut cursor = ByteCursor::new(&buf);
        let decoded = decode_record(&mut cursor, &schema).unwrap();
        assert_eq!(decoded, record);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_union_branch_selection() {
        let schema = sample_schema();
        let record = Record::new()
            .with("id", Value::Long(1))
            .with("flag", Value::Boolean(false))
            .with("ratio", Value::Double(0.0))
            .with("name", Value::String(String::new()))
            .with("blob", Value::Bytes(vec![]))
            .with("kind", Value::String("a".into()))
            .with("note", Value::String("hello".into()));

        let mut buf = Vec::new();
        encode_record(&mut buf, &schema, &record).unwrap();
        let decoded = decode_record(&mut ByteCursor::new(&buf), &schema).unwrap();
        assert_eq!(decoded.get("note"), Some(&Value::String("hello".into())));
        assert_eq!(
            decoded.get("kind"),
            Some(&Value::Enum {
                index: 0,
                symbol: "a".into()
            })
        );
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let schema = sample_schema();
        let record = Record::new().with("id", Value::String("nope".into()));
        let err = encode_record(&mut Vec::new(), &schema, &record).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidValue { ref field, .. } if field == "id"));
    }

    #[test]
    fn test_bad_enum_index_on_decode() {
        let mut field = Field::new("kind", FieldType::Enum);
        field.extra = Some(FieldExtra::Symbols(vec!["only".into()]));
        let schema = ContainerSchema::from_fields("Row", vec![field]);

        let mut buf = Vec::new();
        write_varint_int(&mut buf, 3);
        let err = decode_record(&mut ByteCursor::new(&buf), &schema).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_type_cannot_be_decoded() {
        let schema = ContainerSchema::parse(
            r#"{"fields": [{"name": "m", "type": {"type": "map", "values": "long"}}]}"#,
        )
        .unwrap();
        let err = decode_record(&mut ByteCursor::new(&[0]), &schema).unwrap_err();
        assert!(matches!(err, ContainerError::UnsupportedType { .. }));
    }

    proptest! {
        #[test]
        fn prop_stream_and_slice_varints_agree(value in any::<i64>()) {
            let mut buf = Vec::new();
            write_varint_long(&mut buf, value);

            let from_slice = ByteCursor::new(&buf).read_varint_long().unwrap();
            let from_stream = read_varint_from(&mut Cursor::new(&buf)).unwrap();
            prop_assert_eq!(from_slice, value);
            prop_assert_eq!(from_stream, Some((value, buf.len())));
        }
    }
}
