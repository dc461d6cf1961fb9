//! Error types for the partitioned log and value model.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Stream already exists: {0}")]
    StreamExists(String),

    #[error("Unknown partition {partition} for stream {stream}")]
    UnknownPartition { stream: String, partition: u32 },

    #[error("Invalid partition count {count} for stream {stream}")]
    InvalidPartitionCount { stream: String, count: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
