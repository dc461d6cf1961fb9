//! Partitioned Stream Log
//!
//! The append-only, partitioned log that continuous queries read from and write
//! to. Offsets are assigned on append, start at 0 and grow by one per record.
//!
//! ## Waiting for data
//!
//! Each partition publishes its high watermark (next offset to be assigned)
//! through a `tokio::sync::watch` channel. A reader that has caught up calls
//! [`StreamLog::wait_for`] and is woken by the next append, so idle workers never
//! spin.
//!
//! ## Cursors
//!
//! [`PartitionCursor`] wraps a log and tracks the next offset to consume for one
//! partition. A cursor has exactly one owner.
//!
//! ## Usage
//!
//! ```ignore
//! let log = MemoryStreamLog::new();
//! log.create_stream("readings", 3).await?;
//! log.append("readings", 0, None, None, Bytes::from("{}")).await?;
//!
//! let mut cursor = PartitionCursor::new(Arc::new(log), "readings", 0, 0);
//! let records = cursor.poll(100).await?;
//! ```

use crate::error::{Error, Result};
use crate::record::Record;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Partitioned append-only log
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create a stream with `partitions` empty partitions
    async fn create_stream(&self, stream: &str, partitions: u32) -> Result<()>;

    /// Remove a stream and its records
    async fn drop_stream(&self, stream: &str) -> Result<()>;

    /// Number of partitions of a stream
    async fn partition_count(&self, stream: &str) -> Result<u32>;

    /// Append a record, returning it with its assigned offset.
    ///
    /// `timestamp` of `None` stamps the record with the current time.
    async fn append(
        &self,
        stream: &str,
        partition: u32,
        key: Option<Bytes>,
        timestamp: Option<i64>,
        value: Bytes,
    ) -> Result<Record>;

    /// Read up to `max_records` records starting at `from_offset`
    async fn read(
        &self,
        stream: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<Record>>;

    /// Offset that the next append to the partition will receive
    async fn high_watermark(&self, stream: &str, partition: u32) -> Result<u64>;

    /// Resolve once the partition holds a record at `offset`
    async fn wait_for(&self, stream: &str, partition: u32, offset: u64) -> Result<()>;
}

// ----------------------------------------------------------------------------
// In-memory implementation
// ----------------------------------------------------------------------------

struct Partition {
    records: RwLock<Vec<Record>>,
    watermark: watch::Sender<u64>,
}

impl Partition {
    fn new() -> Self {
        let (watermark, _) = watch::channel(0);
        Self {
            records: RwLock::new(Vec::new()),
            watermark,
        }
    }
}

/// In-memory log, used by the engine in single-process deployments and tests
#[derive(Default)]
pub struct MemoryStreamLog {
    streams: RwLock<HashMap<String, Arc<Vec<Arc<Partition>>>>>,
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn partition(&self, stream: &str, partition: u32) -> Result<Arc<Partition>> {
        let streams = self.streams.read().await;
        let partitions = streams
            .get(stream)
            .ok_or_else(|| Error::UnknownStream(stream.to_string()))?;
        partitions
            .get(partition as usize)
            .cloned()
            .ok_or_else(|| Error::UnknownPartition {
                stream: stream.to_string(),
                partition,
            })
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn create_stream(&self, stream: &str, partitions: u32) -> Result<()> {
        if partitions == 0 {
            return Err(Error::InvalidPartitionCount {
                stream: stream.to_string(),
                count: partitions,
            });
        }

        let mut streams = self.streams.write().await;
        if streams.contains_key(stream) {
            return Err(Error::StreamExists(stream.to_string()));
        }

        let parts = (0..partitions).map(|_| Arc::new(Partition::new())).collect();
        streams.insert(stream.to_string(), Arc::new(parts));

        tracing::debug!(stream = %stream, partitions, "Created stream log");
        Ok(())
    }

    async fn drop_stream(&self, stream: &str) -> Result<()> {
        self.streams
            .write()
            .await
            .remove(stream)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownStream(stream.to_string()))
    }

    async fn partition_count(&self, stream: &str) -> Result<u32> {
        self.streams
            .read()
            .await
            .get(stream)
            .map(|p| p.len() as u32)
            .ok_or_else(|| Error::UnknownStream(stream.to_string()))
    }

    async fn append(
        &self,
        stream: &str,
        partition: u32,
        key: Option<Bytes>,
        timestamp: Option<i64>,
        value: Bytes,
    ) -> Result<Record> {
        let part = self.partition(stream, partition).await?;

        let mut records = part.records.write().await;
        let offset = records.len() as u64;
        let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let record = Record::new(partition, offset, timestamp, key, value);
        records.push(record.clone());
        part.watermark.send_replace(offset + 1);

        Ok(record)
    }

    async fn read(
        &self,
        stream: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<Record>> {
        let part = self.partition(stream, partition).await?;
        let records = part.records.read().await;

        let start = (from_offset as usize).min(records.len());
        let end = start.saturating_add(max_records).min(records.len());
        Ok(records[start..end].to_vec())
    }

    async fn high_watermark(&self, stream: &str, partition: u32) -> Result<u64> {
        let part = self.partition(stream, partition).await?;
        let hwm = *part.watermark.borrow();
        Ok(hwm)
    }

    async fn wait_for(&self, stream: &str, partition: u32, offset: u64) -> Result<()> {
        let mut rx = self.partition(stream, partition).await?.watermark.subscribe();

        // The sender lives in the partition; it only goes away with the stream.
        rx.wait_for(|hwm| *hwm > offset)
            .await
            .map(|_| ())
            .map_err(|_| Error::UnknownStream(stream.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Cursor
// ----------------------------------------------------------------------------

/// Read position of a single owner over one partition
pub struct PartitionCursor {
    log: Arc<dyn StreamLog>,
    stream: String,
    partition: u32,
    current_offset: u64,
}

impl PartitionCursor {
    pub fn new(log: Arc<dyn StreamLog>, stream: &str, partition: u32, start_offset: u64) -> Self {
        Self {
            log,
            stream: stream.to_string(),
            partition,
            current_offset: start_offset,
        }
    }

    /// Poll for the next batch of records.
    ///
    /// Returns up to `max_records` records, or an empty vec when caught up. The
    /// position is not advanced; call [`PartitionCursor::advance`] after a record
    /// has been handled so an interrupted batch resumes at the first unhandled one.
    pub async fn poll(&self, max_records: usize) -> Result<Vec<Record>> {
        self.log
            .read(&self.stream, self.partition, self.current_offset, max_records)
            .await
    }

    /// Move past a handled record
    pub fn advance(&mut self, record: &Record) {
        self.current_offset = record.offset + 1;
    }

    /// Wait until a record exists at the current position
    pub async fn wait(&self) -> Result<()> {
        self.log
            .wait_for(&self.stream, self.partition, self.current_offset)
            .await
    }

    /// Seek to specific offset
    pub fn seek(&mut self, offset: u64) {
        self.current_offset = offset;
    }

    /// Get current position
    pub fn position(&self) -> u64 {
        self.current_offset
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}
