//! Record schema
//!
//! The file header carries a JSON document describing one record type:
//!
//! ```json
//! {"type": "record", "name": "ChangeRecord", "fields": [
//!     {"name": "domain", "type": "int"},
//!     {"name": "event_type", "type": {"type": "enum", "name": "EVENT_TYPES",
//!                                     "symbols": ["insert", "update_before", "update_after", "delete"]}},
//!     {"name": "comment", "type": ["null", "string"]}
//! ]}
//! ```

use crate::error::Result;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::fmt;

/// Type of one record field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    Enum,
    Union,
    /// A type this reader does not understand; decoding it fails
    Unknown,
}

impl FieldType {
    /// Map a primitive type name
    pub fn from_name(name: &str) -> Self {
        match name {
            "null" => FieldType::Null,
            "boolean" => FieldType::Boolean,
            "int" => FieldType::Int,
            "long" => FieldType::Long,
            "float" => FieldType::Float,
            "double" => FieldType::Double,
            "string" => FieldType::String,
            "bytes" => FieldType::Bytes,
            "enum" => FieldType::Enum,
            _ => FieldType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Null => "null",
            FieldType::Boolean => "boolean",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Enum => "enum",
            FieldType::Union => "union",
            FieldType::Unknown => "unknown",
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, FieldType::Enum | FieldType::Union | FieldType::Unknown)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type details that do not fit in [`FieldType`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldExtra {
    /// Enum symbols in index order
    Symbols(Vec<String>),
    /// Union branches in index order
    Branches(Vec<FieldType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub extra: Option<FieldExtra>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            extra: None,
        }
    }

    pub fn symbols(&self) -> Option<&[String]> {
        match &self.extra {
            Some(FieldExtra::Symbols(symbols)) => Some(symbols.as_slice()),
            _ => None,
        }
    }

    pub fn branches(&self) -> Option<&[FieldType]> {
        match &self.extra {
            Some(FieldExtra::Branches(branches)) => Some(branches.as_slice()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    name: Option<String>,
    fields: Vec<FieldDocument>,
}

#[derive(Debug, Deserialize)]
struct FieldDocument {
    name: String,
    #[serde(rename = "type")]
    field_type: JsonValue,
}

/// Ordered list of record fields, immutable once parsed
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSchema {
    name: Option<String>,
    fields: Vec<Field>,
    json: String,
}

impl ContainerSchema {
    /// Parse a schema document
    pub fn parse(json: &str) -> Result<Self> {
        let doc: SchemaDocument = serde_json::from_str(json)?;

        let fields = doc
            .fields
            .into_iter()
            .map(|f| {
                let (field_type, extra) = resolve_type(&f.field_type);
                Field {
                    name: f.name,
                    field_type,
                    extra,
                }
            })
            .collect();

        Ok(Self {
            name: doc.name,
            fields,
            json: json.to_string(),
        })
    }

    /// Build a schema from fields, generating its JSON document
    pub fn from_fields(name: &str, fields: Vec<Field>) -> Self {
        let field_docs: Vec<JsonValue> = fields.iter().map(field_to_json).collect();
        let json = serde_json::json!({
            "type": "record",
            "name": name,
            "fields": field_docs,
        })
        .to_string();

        Self {
            name: Some(name.to_string()),
            fields,
            json,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The schema document as stored in the file header
    pub fn to_json(&self) -> &str {
        &self.json
    }
}

fn resolve_type(value: &JsonValue) -> (FieldType, Option<FieldExtra>) {
    match value {
        JsonValue::String(name) => (FieldType::from_name(name), None),

        JsonValue::Array(branches) => {
            let branches = branches
                .iter()
                .map(|b| match resolve_type(b) {
                    (t, None) if t.is_primitive() => t,
                    _ => FieldType::Unknown,
                })
                .collect();
            (FieldType::Union, Some(FieldExtra::Branches(branches)))
        }

        JsonValue::Object(obj) => match obj.get("type").and_then(JsonValue::as_str) {
            Some("enum") => {
                let symbols = obj
                    .get("symbols")
                    .and_then(JsonValue::as_array)
                    .map(|s| {
                        s.iter()
                            .filter_map(JsonValue::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                (FieldType::Enum, Some(FieldExtra::Symbols(symbols)))
            }
            // {"type": "long"} and friends
            Some(name) => (FieldType::from_name(name), None),
            None => (FieldType::Unknown, None),
        },

        _ => (FieldType::Unknown, None),
    }
}

fn field_to_json(field: &Field) -> JsonValue {
    let field_type = match (&field.field_type, &field.extra) {
        (FieldType::Enum, Some(FieldExtra::Symbols(symbols))) => serde_json::json!({
            "type": "enum",
            "name": field.name,
            "symbols": symbols,
        }),
        (FieldType::Union, Some(FieldExtra::Branches(branches))) => JsonValue::Array(
            branches
                .iter()
                .map(|b| JsonValue::String(b.as_str().to_string()))
                .collect(),
        ),
        (t, _) => JsonValue::String(t.as_str().to_string()),
    };
    serde_json::json!({ "name": field.name, "type": field_type })
}
