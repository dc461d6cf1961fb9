//! Tidewater Core
//!
//! Shared building blocks for the continuous query engine:
//!
//! - [`Value`]: the decoded, tagged-variant value tree of one record
//! - [`Record`]: one immutable message in a partition
//! - [`StreamLog`]: the partitioned append-only log the engine reads and writes
//!
//! The log here is in-process. Transport, retention and replication belong to the
//! broker that sits in front of the engine.

pub mod error;
pub mod log;
pub mod record;
pub mod value;

pub use error::{Error, Result};
pub use log::{MemoryStreamLog, PartitionCursor, StreamLog};
pub use record::Record;
pub use value::Value;
