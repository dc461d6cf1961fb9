//! Partition routing
//!
//! Keyed records go to `siphash(key) % partition_count`, so equal keys always
//! land on the same target partition. Records without a key keep the index of
//! the source partition they were read from (modulo the target count), which
//! keeps the relative order of one source partition intact in the target.

use bytes::Bytes;
use siphasher::sip::SipHasher;
use std::hash::{Hash, Hasher};
use tidewater_core::Value;

use crate::path::FieldPath;

/// Partition for a key; a pure function of `(key, partition_count)`
pub fn route(key: &[u8], partition_count: u32) -> u32 {
    let mut hasher = SipHasher::new();
    key.hash(&mut hasher);
    let hash = hasher.finish();
    (hash % partition_count.max(1) as u64) as u32
}

/// Partition for an output record read from `source_partition`
pub fn route_record(key: Option<&[u8]>, source_partition: u32, partition_count: u32) -> u32 {
    match key {
        Some(k) => route(k, partition_count),
        None => source_partition % partition_count.max(1),
    }
}

/// Key bytes for a value.
///
/// Text is taken as UTF-8, numbers and booleans by their display text and
/// structures as compact JSON. Null has no key.
pub fn key_bytes(value: &Value) -> Option<Bytes> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        other => Some(Bytes::from(other.to_string())),
    }
}

/// Key built from a stream's declared key fields.
///
/// A single field keys by its value; several fields key by the JSON array of
/// their values. No key when every field is null.
pub fn key_from_fields(value: &Value, fields: &[FieldPath]) -> Option<Bytes> {
    match fields {
        [] => None,
        [single] => key_bytes(single.resolve(value)),
        many => {
            let parts: Vec<Value> = many.iter().map(|f| f.resolve(value).clone()).collect();
            if parts.iter().all(Value::is_null) {
                return None;
            }
            Some(Bytes::from(Value::Seq(parts).to_json_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_deterministic() {
        for n in [1, 3, 8, 64] {
            let first = route(b"E05", n);
            assert!(first < n);
            for _ in 0..10 {
                assert_eq!(route(b"E05", n), first);
            }
        }
    }

    #[test]
    fn test_route_spreads_keys() {
        let partitions: std::collections::HashSet<u32> = (0..200)
            .map(|i| route(format!("station-{i}").as_bytes(), 8))
            .collect();
        assert!(partitions.len() > 4);
    }

    #[test]
    fn test_unkeyed_records_keep_source_partition() {
        assert_eq!(route_record(None, 2, 4), 2);
        assert_eq!(route_record(None, 5, 4), 1);
        assert_eq!(route_record(None, 0, 1), 0);
    }

    #[test]
    fn test_keyed_records_follow_hash() {
        assert_eq!(route_record(Some(b"k"), 3, 5), route(b"k", 5));
    }

    #[test]
    fn test_key_bytes_rendering() {
        assert_eq!(key_bytes(&Value::from("E05")), Some(Bytes::from("E05")));
        assert_eq!(key_bytes(&Value::Int(42)), Some(Bytes::from("42")));
        assert_eq!(key_bytes(&Value::Double(1.0)), Some(Bytes::from("1.0")));
        assert_ne!(key_bytes(&Value::Double(1.0)), key_bytes(&Value::Int(1)));
        assert_eq!(key_bytes(&Value::Bool(true)), Some(Bytes::from("true")));
        assert_eq!(key_bytes(&Value::Null), None);
        assert_eq!(
            key_bytes(&Value::structure([("a", Value::Int(1))])),
            Some(Bytes::from(r#"{"a":1}"#))
        );
    }

    #[test]
    fn test_key_from_fields() {
        let value = Value::structure([
            ("stationId", Value::from("E05")),
            ("region", Value::from("north")),
        ]);
        let station = FieldPath::parse("stationId").unwrap();
        let region = FieldPath::parse("region").unwrap();
        let missing = FieldPath::parse("missing").unwrap();

        assert_eq!(key_from_fields(&value, &[]), None);
        assert_eq!(
            key_from_fields(&value, &[station.clone()]),
            Some(Bytes::from("E05"))
        );
        assert_eq!(
            key_from_fields(&value, &[station, region]),
            Some(Bytes::from(r#"["E05","north"]"#))
        );
        assert_eq!(key_from_fields(&value, &[missing.clone(), missing]), None);
    }
}
