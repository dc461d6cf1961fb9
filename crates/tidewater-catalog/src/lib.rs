//! Tidewater Schema Catalog
//!
//! Holds the declared schema and serialization format of every stream, and the
//! codecs that turn payload bytes into value trees and back.
//!
//! # Features
//!
//! - **Stream registry**: register, look up, list, describe and drop streams
//! - **Durable definitions**: every registration is persisted through a
//!   [`CatalogStorage`] so a restarted engine resumes without re-declaration
//! - **Codecs**: JSON and Avro (Confluent wire framing), schema-on-read
//!
//! # Usage
//!
//! ```ignore
//! use tidewater_catalog::{SchemaCatalog, StreamDefinition, Schema, Field, FieldType};
//!
//! let catalog = SchemaCatalog::in_memory();
//! let schema = Schema::new(vec![Field::new(
//!     "reading",
//!     FieldType::Struct {
//!         fields: vec![
//!             Field::new("value", FieldType::Double),
//!             Field::new("ts", FieldType::Text),
//!         ],
//!     },
//! )]);
//!
//! let handle = catalog.register(StreamDefinition::new("STATION_A", schema)).await?;
//! let codec = catalog.codec("STATION_A").await?;
//! let value = codec.decode(br#"{"reading":{"value":0.0,"ts":"2018-08-30T04:00:00Z"}}"#)?;
//! ```

pub mod catalog;
pub mod codec;
pub mod error;
pub mod storage;
pub mod types;

pub use catalog::SchemaCatalog;
pub use codec::{deserialize_with_schema_id, serialize_with_schema_id, StreamCodec};
pub use error::{CatalogError, Result};
pub use storage::{CatalogStorage, FileCatalogStorage, MemoryCatalogStorage};
pub use types::*;
