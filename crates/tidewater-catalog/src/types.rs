//! Core Catalog Types

use crate::error::{CatalogError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Serialization format of a stream's payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SerializationFormat {
    #[default]
    #[serde(alias = "json")]
    Json,
    #[serde(alias = "avro")]
    Avro,
}

impl SerializationFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationFormat::Json => "JSON",
            SerializationFormat::Avro => "AVRO",
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializationFormat {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(SerializationFormat::Json),
            "AVRO" => Ok(SerializationFormat::Avro),
            other => Err(CatalogError::InvalidSchema(format!(
                "unknown serialization format: {other}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Schema
// ----------------------------------------------------------------------------

/// Declared type of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldType {
    #[serde(alias = "string", alias = "varchar")]
    Text,
    #[serde(alias = "float")]
    Double,
    #[serde(alias = "int", alias = "bigint", alias = "long")]
    Integer,
    #[serde(alias = "bool")]
    Boolean,
    /// Ordered named children
    Struct { fields: Vec<Field> },
    /// Repeated elements of one type, usually a struct
    Array { items: Box<FieldType> },
}

impl FieldType {
    /// Sequence of structs, the usual shape of repeated readings
    pub fn array_of(items: FieldType) -> Self {
        FieldType::Array {
            items: Box::new(items),
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::Struct { .. } | FieldType::Array { .. })
    }

    /// Short lowercase name used in mismatch errors
    pub fn kind(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Double => "double",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Struct { .. } => "struct",
            FieldType::Array { .. } => "array",
        }
    }

    /// Child field of a struct type
    pub fn field(&self, name: &str) -> Option<&Field> {
        match self {
            FieldType::Struct { fields } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// SQL-style rendering, e.g. `STRUCT<value DOUBLE, ts VARCHAR>`
    pub fn sql_name(&self) -> String {
        match self {
            FieldType::Text => "VARCHAR".to_string(),
            FieldType::Double => "DOUBLE".to_string(),
            FieldType::Integer => "BIGINT".to_string(),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Struct { fields } => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{} {}", f.name, f.field_type.sql_name()))
                    .collect();
                format!("STRUCT<{}>", inner.join(", "))
            }
            FieldType::Array { items } => format!("ARRAY<{}>", items.sql_name()),
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        match self {
            FieldType::Struct { fields } => validate_fields(fields, path),
            FieldType::Array { items } => items.validate(&format!("{path}[]")),
            _ => Ok(()),
        }
    }
}

/// A named, typed field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,

    #[serde(flatten)]
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Tree of typed fields, fixed for the lifetime of a stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// The whole schema viewed as one struct type
    pub fn as_struct(&self) -> FieldType {
        FieldType::Struct {
            fields: self.fields.clone(),
        }
    }

    /// Reject empty schemas, blank names and duplicate names at any level
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(CatalogError::InvalidSchema(
                "schema must declare at least one field".to_string(),
            ));
        }
        validate_fields(&self.fields, "")
    }
}

fn validate_fields(fields: &[Field], path: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        let field_path = if path.is_empty() {
            field.name.clone()
        } else {
            format!("{path}.{}", field.name)
        };
        if field.name.trim().is_empty() {
            return Err(CatalogError::InvalidSchema(format!(
                "empty field name under {}",
                if path.is_empty() { "<root>" } else { path }
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(CatalogError::InvalidSchema(format!(
                "duplicate field name: {field_path}"
            )));
        }
        field.field_type.validate(&field_path)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Stream definitions
// ----------------------------------------------------------------------------

/// Declared event-time column of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampColumn {
    /// Path of the field holding the event time
    pub field: String,

    /// Pattern of a text field; `None` means the field holds epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

fn default_partitions() -> u32 {
    1
}

fn default_replicas() -> u16 {
    1
}

/// Registration request for a stream, the `CREATE STREAM` surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub name: String,

    /// Backing topic; defaults to the stream name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    #[serde(default)]
    pub format: SerializationFormat,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Recorded for the broker; the engine does not replicate
    #[serde(default = "default_replicas")]
    pub replicas: u16,

    /// Fields whose values form the record key when producing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_fields: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampColumn>,

    pub schema: Schema,
}

impl StreamDefinition {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            topic: None,
            format: SerializationFormat::Json,
            partitions: 1,
            replicas: 1,
            key_fields: Vec::new(),
            timestamp: None,
            schema,
        }
    }

    pub fn with_format(mut self, format: SerializationFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_key_fields(mut self, fields: Vec<String>) -> Self {
        self.key_fields = fields;
        self
    }

    pub fn with_timestamp(mut self, field: impl Into<String>, format: Option<String>) -> Self {
        self.timestamp = Some(TimestampColumn {
            field: field.into(),
            format,
        });
        self
    }

    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::InvalidSchema(
                "stream name must not be empty".to_string(),
            ));
        }
        if self.partitions == 0 {
            return Err(CatalogError::InvalidSchema(format!(
                "stream {} must have at least one partition",
                self.name
            )));
        }
        self.schema.validate()
    }
}

/// A stream as held by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredStream {
    /// Catalog-assigned id, also the schema id in Avro framing
    pub id: i32,

    pub definition: StreamDefinition,

    /// Registration time in milliseconds since epoch
    pub registered_at: i64,
}

/// Returned by a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: i32,
    pub name: String,
}

/// Row of a stream listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub topic: String,
    pub format: SerializationFormat,
    pub partitions: u32,
}

/// One column of a stream description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub type_name: String,
}

/// Full description of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescription {
    pub name: String,
    pub topic: String,
    pub format: SerializationFormat,
    pub partitions: u32,
    pub replicas: u16,
    pub key_fields: Vec<String>,
    pub timestamp_field: Option<String>,
    pub columns: Vec<ColumnDescription>,
}

impl From<&StreamDefinition> for StreamDescription {
    fn from(def: &StreamDefinition) -> Self {
        Self {
            name: def.name.clone(),
            topic: def.topic().to_string(),
            format: def.format,
            partitions: def.partitions,
            replicas: def.replicas,
            key_fields: def.key_fields.clone(),
            timestamp_field: def.timestamp.as_ref().map(|t| t.field.clone()),
            columns: def
                .schema
                .fields
                .iter()
                .map(|f| ColumnDescription {
                    name: f.name.clone(),
                    type_name: f.field_type.sql_name(),
                })
                .collect(),
        }
    }
}
