//! Decoded record values

use serde_json::{Map, Number, Value as JsonValue};

/// One field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Enum { index: i32, symbol: String },
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Enum { .. } => "enum",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            Value::Enum { symbol, .. } => Some(symbol.as_str()),
            _ => None,
        }
    }

    /// JSON rendering; bytes become a lossy UTF-8 string and non-finite
    /// floats become null
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Int(v) => JsonValue::from(*v),
            Value::Long(v) => JsonValue::from(*v),
            Value::Float(v) => Number::from_f64(f64::from(*v))
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Double(v) => Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
            Value::Enum { symbol, .. } => JsonValue::String(symbol.clone()),
        }
    }
}

/// Field values of one record, in schema order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    /// Builder-style [`Record::push`]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_to_json() {
        let record = Record::new()
            .with("domain", Value::Int(0))
            .with("sequence", Value::Long(42))
            .with(
                "event_type",
                Value::Enum {
                    index: 0,
                    symbol: "insert".into(),
                },
            )
            .with("comment", Value::Null)
            .with("ratio", Value::Double(0.5));

        let json = record.to_json();
        assert_eq!(json["sequence"], 42);
        assert_eq!(json["event_type"], "insert");
        assert!(json["comment"].is_null());
        assert_eq!(json["ratio"], 0.5);
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert!(Value::Double(f64::NAN).to_json().is_null());
        assert!(Value::Float(f32::INFINITY).to_json().is_null());
    }

    #[test]
    fn test_get_and_accessors() {
        let record = Record::new().with("id", Value::Int(7));
        assert_eq!(record.get("id").and_then(Value::as_i64), Some(7));
        assert!(record.get("missing").is_none());
        assert_eq!(Value::String("x".into()).as_str(), Some("x"));
    }
}
