//! Record Codecs
//!
//! Decode payload bytes into value trees according to a stream schema, and
//! encode value trees back into the stream's format.
//!
//! ## Schema-on-read
//!
//! - Missing fields decode to null
//! - Extra fields are dropped
//! - A structural conflict (e.g. an array where a struct is declared) fails with
//!   `SchemaMismatch` naming the offending path
//! - Bytes that are not valid for the format fail with `MalformedRecord`
//!
//! ## Avro wire format
//!
//! Avro payloads carry the Confluent header:
//! `[magic_byte(1)][schema_id(4, big-endian)][avro datum(N)]`, where the schema id
//! is the catalog id of the stream. Every declared field is written as a
//! `["null", T]` union so absent values survive the round trip.

use crate::error::{CatalogError, Result};
use crate::types::{Field, FieldType, Schema, SerializationFormat};
use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::json;
use tidewater_core::Value;

/// Magic byte indicating schema ID is present
const MAGIC_BYTE: u8 = 0x00;

/// Serialize data with schema ID
///
/// Format: [magic_byte(1)][schema_id(4)][data(N)]
pub fn serialize_with_schema_id(schema_id: i32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + data.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_i32(schema_id);
    buf.put_slice(data);
    buf.freeze()
}

/// Split a framed payload into its schema ID and body
pub fn deserialize_with_schema_id(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < 5 {
        return Err(CatalogError::MalformedRecord(
            "Data too short to contain schema ID".to_string(),
        ));
    }

    if data[0] != MAGIC_BYTE {
        return Err(CatalogError::MalformedRecord(format!(
            "Invalid magic byte: expected 0x00, got 0x{:02x}",
            data[0]
        )));
    }

    let mut id_bytes = &data[1..5];
    let schema_id = id_bytes.get_i32();

    Ok((schema_id, &data[5..]))
}

/// Codec bound to one stream's schema and format
#[derive(Debug, Clone)]
pub struct StreamCodec {
    schema: Schema,
    format: SerializationFormat,
    schema_id: i32,
    avro: Option<AvroSchema>,
}

impl StreamCodec {
    /// Build a codec; for Avro streams this derives and validates the Avro schema
    pub fn new(
        stream_name: &str,
        schema: &Schema,
        format: SerializationFormat,
        schema_id: i32,
    ) -> Result<Self> {
        let avro = match format {
            SerializationFormat::Avro => Some(avro_schema(stream_name, schema)?),
            SerializationFormat::Json => None,
        };

        Ok(Self {
            schema: schema.clone(),
            format,
            schema_id,
            avro,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn schema_id(&self) -> i32 {
        self.schema_id
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match &self.avro {
            None => decode_json(bytes, &self.schema),
            Some(avro) => {
                let (schema_id, body) = deserialize_with_schema_id(bytes)?;
                if schema_id != self.schema_id {
                    return Err(CatalogError::MalformedRecord(format!(
                        "payload written with schema id {schema_id}, stream uses {}",
                        self.schema_id
                    )));
                }
                let datum = apache_avro::from_avro_datum(avro, &mut &body[..], None)
                    .map_err(|e| CatalogError::MalformedRecord(e.to_string()))?;
                from_avro(datum, &self.schema.as_struct(), "")
            }
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Bytes> {
        match &self.avro {
            None => encode_json(value, &self.schema),
            Some(avro) => {
                let datum = to_avro(value, &self.schema.as_struct(), "")?;
                let body = apache_avro::to_avro_datum(avro, datum)
                    .map_err(|e| CatalogError::MalformedRecord(e.to_string()))?;
                Ok(serialize_with_schema_id(self.schema_id, &body))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------------

/// Decode a JSON object payload against a schema
pub fn decode_json(bytes: &[u8], schema: &Schema) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| CatalogError::MalformedRecord(e.to_string()))?;

    if !json.is_object() {
        return Err(CatalogError::mismatch("", "struct", json_kind(&json)));
    }
    conform_json(json, &schema.as_struct(), "")
}

/// Encode a value tree as a JSON object with fields in schema order
pub fn encode_json(value: &Value, schema: &Schema) -> Result<Bytes> {
    let shaped = conform_value(value, &schema.as_struct(), "")?;
    Ok(Bytes::from(serde_json::to_vec(&shaped)?))
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "text",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn child_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn conform_json(json: serde_json::Value, ty: &FieldType, path: &str) -> Result<Value> {
    use serde_json::Value as Json;

    match (ty, json) {
        (_, Json::Null) => Ok(Value::Null),
        (FieldType::Text, Json::String(s)) => Ok(Value::Text(s)),
        (FieldType::Boolean, Json::Bool(b)) => Ok(Value::Bool(b)),
        (FieldType::Double, Json::Number(n)) => n
            .as_f64()
            .map(Value::Double)
            .ok_or_else(|| CatalogError::mismatch(path, "double", n)),
        (FieldType::Integer, Json::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Value::Int(i)),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(Value::Int(f as i64))
                }
                _ => Err(CatalogError::mismatch(path, "integer", n)),
            },
        },
        (FieldType::Struct { fields }, Json::Object(mut map)) => {
            let mut out = Vec::with_capacity(fields.len());
            for field in fields {
                let child = match map.remove(&field.name) {
                    Some(v) => conform_json(v, &field.field_type, &child_path(path, &field.name))?,
                    None => Value::Null,
                };
                out.push((field.name.clone(), child));
            }
            Ok(Value::Struct(out))
        }
        (FieldType::Array { items }, Json::Array(elements)) => elements
            .into_iter()
            .enumerate()
            .map(|(i, v)| conform_json(v, items, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>>>()
            .map(Value::Seq),
        (ty, other) => Err(CatalogError::mismatch(path, ty.kind(), json_kind(&other))),
    }
}

/// Reshape a value to a declared type: struct children in declared order,
/// missing children null, integers widened into double fields
fn conform_value(value: &Value, ty: &FieldType, path: &str) -> Result<Value> {
    match (ty, value) {
        (_, Value::Null) => Ok(Value::Null),
        (FieldType::Text, Value::Text(_))
        | (FieldType::Boolean, Value::Bool(_))
        | (FieldType::Integer, Value::Int(_))
        | (FieldType::Double, Value::Double(_)) => Ok(value.clone()),
        (FieldType::Double, Value::Int(i)) => Ok(Value::Double(*i as f64)),
        (FieldType::Struct { fields }, Value::Struct(_)) => fields
            .iter()
            .map(|field| {
                let child = value.field(&field.name).unwrap_or(&Value::NULL);
                conform_value(child, &field.field_type, &child_path(path, &field.name))
                    .map(|v| (field.name.clone(), v))
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Struct),
        (FieldType::Array { items }, Value::Seq(elements)) => elements
            .iter()
            .enumerate()
            .map(|(i, v)| conform_value(v, items, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>>>()
            .map(Value::Seq),
        (ty, other) => Err(CatalogError::mismatch(path, ty.kind(), other.type_name())),
    }
}

// ----------------------------------------------------------------------------
// Avro
// ----------------------------------------------------------------------------

/// Avro names allow `[A-Za-z_][A-Za-z0-9_]*`
fn avro_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn avro_type(ty: &FieldType, record_name: &str) -> serde_json::Value {
    match ty {
        FieldType::Text => json!("string"),
        FieldType::Double => json!("double"),
        FieldType::Integer => json!("long"),
        FieldType::Boolean => json!("boolean"),
        FieldType::Struct { fields } => avro_record(record_name, fields),
        FieldType::Array { items } => json!({
            "type": "array",
            "items": ["null", avro_type(items, &format!("{record_name}_item"))],
        }),
    }
}

fn avro_record(record_name: &str, fields: &[Field]) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = fields
        .iter()
        .map(|f| {
            let nested = format!("{record_name}_{}", avro_name(&f.name));
            json!({
                "name": f.name,
                "type": ["null", avro_type(&f.field_type, &nested)],
                "default": null,
            })
        })
        .collect();
    json!({ "type": "record", "name": record_name, "fields": fields })
}

/// Derive the Avro record schema of a stream
pub fn avro_schema(stream_name: &str, schema: &Schema) -> Result<AvroSchema> {
    let definition = avro_record(&avro_name(stream_name), &schema.fields);
    AvroSchema::parse(&definition).map_err(|e| CatalogError::InvalidSchema(e.to_string()))
}

fn nullable(value: &Value, ty: &FieldType, path: &str) -> Result<AvroValue> {
    if value.is_null() {
        return Ok(AvroValue::Union(0, Box::new(AvroValue::Null)));
    }
    Ok(AvroValue::Union(1, Box::new(to_avro(value, ty, path)?)))
}

fn to_avro(value: &Value, ty: &FieldType, path: &str) -> Result<AvroValue> {
    match (ty, value) {
        (FieldType::Text, Value::Text(s)) => Ok(AvroValue::String(s.clone())),
        (FieldType::Boolean, Value::Bool(b)) => Ok(AvroValue::Boolean(*b)),
        (FieldType::Integer, Value::Int(i)) => Ok(AvroValue::Long(*i)),
        (FieldType::Double, Value::Double(d)) => Ok(AvroValue::Double(*d)),
        (FieldType::Double, Value::Int(i)) => Ok(AvroValue::Double(*i as f64)),
        (FieldType::Struct { fields }, Value::Struct(_)) => fields
            .iter()
            .map(|field| {
                let child = value.field(&field.name).unwrap_or(&Value::NULL);
                nullable(child, &field.field_type, &child_path(path, &field.name))
                    .map(|v| (field.name.clone(), v))
            })
            .collect::<Result<Vec<_>>>()
            .map(AvroValue::Record),
        (FieldType::Array { items }, Value::Seq(elements)) => elements
            .iter()
            .enumerate()
            .map(|(i, v)| nullable(v, items, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>>>()
            .map(AvroValue::Array),
        (ty, other) => Err(CatalogError::mismatch(path, ty.kind(), other.type_name())),
    }
}

fn from_avro(datum: AvroValue, ty: &FieldType, path: &str) -> Result<Value> {
    match (ty, datum) {
        (ty, AvroValue::Union(_, inner)) => from_avro(*inner, ty, path),
        (_, AvroValue::Null) => Ok(Value::Null),
        (FieldType::Text, AvroValue::String(s)) => Ok(Value::Text(s)),
        (FieldType::Boolean, AvroValue::Boolean(b)) => Ok(Value::Bool(b)),
        (FieldType::Integer, AvroValue::Long(i)) => Ok(Value::Int(i)),
        (FieldType::Integer, AvroValue::Int(i)) => Ok(Value::Int(i as i64)),
        (FieldType::Double, AvroValue::Double(d)) => Ok(Value::Double(d)),
        (FieldType::Double, AvroValue::Float(f)) => Ok(Value::Double(f as f64)),
        (FieldType::Struct { fields }, AvroValue::Record(mut record)) => {
            let mut out = Vec::with_capacity(fields.len());
            for field in fields {
                let child = match record.iter().position(|(name, _)| name == &field.name) {
                    Some(idx) => {
                        let (_, v) = record.swap_remove(idx);
                        from_avro(v, &field.field_type, &child_path(path, &field.name))?
                    }
                    None => Value::Null,
                };
                out.push((field.name.clone(), child));
            }
            Ok(Value::Struct(out))
        }
        (FieldType::Array { items }, AvroValue::Array(elements)) => elements
            .into_iter()
            .enumerate()
            .map(|(i, v)| from_avro(v, items, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>>>()
            .map(Value::Seq),
        (ty, other) => Err(CatalogError::mismatch(path, ty.kind(), format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station_a() -> Schema {
        Schema::new(vec![
            Field::new("stationId", FieldType::Text),
            Field::new(
                "reading",
                FieldType::Struct {
                    fields: vec![
                        Field::new("value", FieldType::Double),
                        Field::new("ts", FieldType::Text),
                    ],
                },
            ),
        ])
    }

    fn station_b() -> Schema {
        Schema::new(vec![
            Field::new("stationId", FieldType::Text),
            Field::new(
                "readings",
                FieldType::array_of(FieldType::Struct {
                    fields: vec![
                        Field::new("value", FieldType::Double),
                        Field::new("count", FieldType::Integer),
                    ],
                }),
            ),
        ])
    }

    fn sample_b() -> Value {
        Value::structure([
            ("stationId", Value::from("E05")),
            (
                "readings",
                Value::Seq(vec![
                    Value::structure([
                        ("value", Value::Double(0.123456789012345)),
                        ("count", Value::Int(3)),
                    ]),
                    Value::structure([("value", Value::Null), ("count", Value::Int(-9))]),
                ]),
            ),
        ])
    }

    #[test]
    fn test_serialize_deserialize_schema_id() {
        let framed = serialize_with_schema_id(123, b"hello world");
        assert_eq!(framed[0], MAGIC_BYTE);

        let (id, body) = deserialize_with_schema_id(&framed).unwrap();
        assert_eq!(id, 123);
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn test_framing_rejects_short_and_bad_magic() {
        assert!(matches!(
            deserialize_with_schema_id(&[0, 0, 0]),
            Err(CatalogError::MalformedRecord(_))
        ));
        assert!(matches!(
            deserialize_with_schema_id(&[1, 0, 0, 0, 1, 9]),
            Err(CatalogError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_json_missing_fields_are_null_and_extras_dropped() {
        let value = decode_json(
            br#"{"stationId":"E01","extra":true,"reading":{"value":1.5}}"#,
            &station_a(),
        )
        .unwrap();

        assert_eq!(
            value,
            Value::structure([
                ("stationId", Value::from("E01")),
                (
                    "reading",
                    Value::structure([("value", Value::Double(1.5)), ("ts", Value::Null)])
                ),
            ])
        );
    }

    #[test]
    fn test_json_structural_conflict_is_schema_mismatch() {
        let err = decode_json(br#"{"readings": 4.2}"#, &station_b()).unwrap_err();
        match err {
            CatalogError::SchemaMismatch { path, expected, .. } => {
                assert_eq!(path, "readings");
                assert_eq!(expected, "array");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_json_nested_mismatch_reports_index() {
        let err = decode_json(
            br#"{"readings":[{"value":1.0},{"value":"high"}]}"#,
            &station_b(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("readings[1].value"));
    }

    #[test]
    fn test_json_not_json_is_malformed() {
        assert!(matches!(
            decode_json(b"{not json", &station_a()),
            Err(CatalogError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_json_top_level_must_be_object() {
        assert!(matches!(
            decode_json(b"[1,2]", &station_a()),
            Err(CatalogError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_json_whole_float_into_integer() {
        let value = decode_json(br#"{"readings":[{"count":4.0}]}"#, &station_b()).unwrap();
        let first = value.field("readings").and_then(|r| r.element(0)).unwrap();
        assert_eq!(first.field("count"), Some(&Value::Int(4)));

        assert!(decode_json(br#"{"readings":[{"count":4.5}]}"#, &station_b()).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let codec = StreamCodec::new("STATION_B", &station_b(), SerializationFormat::Json, 1)
            .unwrap();
        let bytes = codec.encode(&sample_b()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample_b());
    }

    #[test]
    fn test_json_encode_orders_fields_by_schema() {
        let value = Value::structure([
            ("reading", Value::structure([("ts", Value::from("t")), ("value", Value::Double(2.0))])),
            ("stationId", Value::from("E02")),
        ]);
        let bytes = encode_json(&value, &station_a()).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"stationId":"E02","reading":{"value":2.0,"ts":"t"}}"#
        );
    }

    #[test]
    fn test_avro_round_trip() {
        let codec = StreamCodec::new("STATION_B", &station_b(), SerializationFormat::Avro, 42)
            .unwrap();
        let bytes = codec.encode(&sample_b()).unwrap();

        let (id, _) = deserialize_with_schema_id(&bytes).unwrap();
        assert_eq!(id, 42);
        assert_eq!(codec.decode(&bytes).unwrap(), sample_b());
    }

    #[test]
    fn test_avro_missing_fields_encode_as_null() {
        let codec = StreamCodec::new("STATION_A", &station_a(), SerializationFormat::Avro, 7)
            .unwrap();
        let partial = Value::structure([("stationId", Value::from("E03"))]);

        let decoded = codec.decode(&codec.encode(&partial).unwrap()).unwrap();
        assert_eq!(decoded.field("stationId"), Some(&Value::from("E03")));
        assert_eq!(decoded.field("reading"), Some(&Value::Null));
    }

    #[test]
    fn test_avro_rejects_foreign_schema_id() {
        let writer = StreamCodec::new("S", &station_a(), SerializationFormat::Avro, 1).unwrap();
        let reader = StreamCodec::new("S", &station_a(), SerializationFormat::Avro, 2).unwrap();

        let bytes = writer
            .encode(&Value::structure([("stationId", Value::from("x"))]))
            .unwrap();
        assert!(matches!(
            reader.decode(&bytes),
            Err(CatalogError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_avro_garbage_is_malformed() {
        let codec = StreamCodec::new("S", &station_a(), SerializationFormat::Avro, 1).unwrap();
        assert!(matches!(
            codec.decode(b"{\"json\": true}"),
            Err(CatalogError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_avro_name_sanitizing() {
        assert_eq!(avro_name("station-a"), "station_a");
        assert_eq!(avro_name("1st"), "_1st");
        assert_eq!(avro_name(""), "_");
    }

    #[test]
    fn test_double_precision_survives_both_formats() {
        let schema = Schema::new(vec![Field::new("v", FieldType::Double)]);
        for format in [SerializationFormat::Json, SerializationFormat::Avro] {
            let codec = StreamCodec::new("P", &schema, format, 1).unwrap();
            for v in [0.1 + 0.2, f64::MIN_POSITIVE, 1e300, -2.5e-7, 123456.789012345678] {
                let value = Value::structure([("v", Value::Double(v))]);
                let decoded = codec.decode(&codec.encode(&value).unwrap()).unwrap();
                let back = decoded.field("v").and_then(Value::as_f64).unwrap();
                assert_eq!(back.to_bits(), v.to_bits(), "format {format}, value {v}");
            }
        }
    }
}
