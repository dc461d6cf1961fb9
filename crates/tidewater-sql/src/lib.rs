//! Tidewater Continuous Query Engine
//!
//! Standing queries over partitioned streams of semi-structured records. Each
//! query reads one or more source streams forever and appends a derived record
//! to its target stream for every input record that passes its filter.
//!
//! ## Example
//!
//! ```ignore
//! let engine = QueryEngine::new(catalog, log, EngineConfig::default());
//!
//! // SELECT reading.value AS READING_VALUE
//! // FROM STATION_A
//! // WHERE reading.value > 0.5
//! // PARTITION BY stationId
//! let query = QueryDefinition::new("STATION_A", "HIGH_READINGS")
//!     .project("READING_VALUE", Expr::path("reading.value")?)
//!     .filter(Expr::binary(BinaryOp::Gt, Expr::path("reading.value")?, Expr::lit(0.5)))
//!     .partition_by(Expr::path("stationId")?);
//!
//! let handle = engine.submit_query(query).await?;
//! ```
//!
//! ## Guarantees
//!
//! - Records of one source partition are processed in offset order
//! - Equal keys land on the same target partition
//! - An output record's event time is the input's, or the declared timestamp field
//! - A bad record is counted and skipped; the query keeps running
//! - Delivery is at-least-once
//!
//! ## Limitations
//!
//! - No windowed aggregation
//! - No stream-stream joins
//! - No SQL text; queries are built as [`QueryDefinition`] values

pub mod error;
pub mod expr;
pub mod functions;
pub mod path;
pub mod query;
pub mod router;
pub mod scheduler;
pub mod timestamp;

pub use error::SqlError;
pub use expr::{BinaryOp, Expr, MetaColumn, RowContext};
pub use functions::Function;
pub use path::{FieldPath, PathStep};
pub use query::{
    Outcome, OutputRecord, Projection, QueryDefinition, QueryPipeline, SourceBinding,
    StartPosition,
};
pub use router::{key_bytes, route, route_record};
pub use scheduler::{
    CursorPosition, EngineConfig, QueryEngine, QueryHandle, QueryInfo, QueryStats, QueryStatus,
    QuerySignal, ResourceLimits,
};
pub use timestamp::{format_timestamp, parse_timestamp, TimestampResolver, TimestampSpec};

/// Result type for query operations
pub type Result<T> = std::result::Result<T, SqlError>;
