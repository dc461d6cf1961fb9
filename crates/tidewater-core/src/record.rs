//! Record Data Structure
//!
//! A record is one message in one partition of a stream. It is produced once,
//! read by any number of continuous queries, and never mutated.
//!
//! ## Structure
//! - **partition**: partition the record lives in
//! - **offset**: position within the partition, assigned by the log, starting at 0
//! - **timestamp**: event time in milliseconds since epoch (arrival time unless a
//!   writer supplied one)
//! - **key**: optional opaque bytes used for partition routing
//! - **value**: the encoded payload (JSON or Avro, per the stream's format)

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record in a stream partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Partition this record was appended to
    pub partition: u32,

    /// Offset of this record in the partition
    pub offset: u64,

    /// Event time in milliseconds since epoch
    pub timestamp: i64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Value (payload)
    pub value: Bytes,
}

impl Record {
    pub fn new(
        partition: u32,
        offset: u64,
        timestamp: i64,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Self {
        Self {
            partition,
            offset,
            timestamp,
            key,
            value,
        }
    }

    /// Estimate the size of this record in bytes
    pub fn estimated_size(&self) -> usize {
        4 + // partition
        8 + // offset
        8 + // timestamp
        self.key.as_ref().map(|k| k.len()).unwrap_or(0) +
        self.value.len()
    }

    /// Key as UTF-8 text, when present and valid
    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_ref()
            .and_then(|k| std::str::from_utf8(k).ok())
    }
}
