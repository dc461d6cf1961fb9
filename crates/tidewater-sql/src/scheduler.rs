//! Continuous query engine
//!
//! Owns the running continuous queries: submission, execution, pausing,
//! resuming and stopping. Every query runs one Tokio task per source partition;
//! each task is the only owner of its read cursor, so records of one partition
//! are handled strictly in offset order. All tasks of a query are controlled
//! through one [`tokio::sync::watch`] channel of [`QuerySignal`].
//!
//! A task that has caught up with its partition parks on
//! [`PartitionCursor::wait`] and is woken by the next append, or by a signal.
//!
//! Per-record failures (malformed payloads, schema conflicts, evaluation and
//! timestamp errors) are logged, counted and skipped; they never stop a query.
//! Any other failure marks the query `Failed` and stops all of its tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tidewater_catalog::{SchemaCatalog, StreamDefinition, StreamDescription, StreamInfo};
use tidewater_core::{PartitionCursor, Record, StreamLog, Value};
use tidewater_observability::metrics::{
    ACTIVE_QUERIES, QUERY_MESSAGES_EMITTED_TOTAL, QUERY_MESSAGES_FAILED_TOTAL,
    QUERY_MESSAGES_FILTERED_TOTAL, QUERY_MESSAGES_PROCESSED_TOTAL, QUERY_PROCESSING_SECONDS,
    STREAM_APPENDS_TOTAL,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SqlError;
use crate::path::FieldPath;
use crate::query::{Outcome, QueryDefinition, QueryPipeline, StartPosition};
use crate::router;
use crate::Result;

// ---------------------------------------------------------------------------
// Query status
// ---------------------------------------------------------------------------

/// Lifecycle status of a continuous query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Query is actively processing records.
    Running,
    /// Query has been paused (can be resumed).
    Paused,
    /// Query has been stopped (terminal state).
    Stopped,
    /// Query hit a failure that is not scoped to one record (terminal state).
    Failed,
}

impl QueryStatus {
    fn is_active(&self) -> bool {
        matches!(self, QueryStatus::Running | QueryStatus::Paused)
    }
}

// ---------------------------------------------------------------------------
// Query statistics
// ---------------------------------------------------------------------------

/// Runtime statistics for a continuous query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStats {
    /// Records read from the sources, whatever their outcome.
    pub messages_processed: u64,
    /// Records appended to the target.
    pub messages_emitted: u64,
    /// Records rejected by the filter.
    pub messages_filtered: u64,
    /// Records dropped because of a per-record error.
    pub messages_failed: u64,
    /// Event time of the last processed record (ms since epoch).
    pub last_processed_timestamp: Option<i64>,
    /// When the query started running (ms since epoch).
    pub started_at: i64,
    /// Timestamp of the most recent activity (ms since epoch).
    pub last_active: i64,
}

impl Default for QueryStats {
    fn default() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            messages_processed: 0,
            messages_emitted: 0,
            messages_filtered: 0,
            messages_failed: 0,
            last_processed_timestamp: None,
            started_at: now,
            last_active: now,
        }
    }
}

/// Next offset a worker will read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub stream: String,
    pub partition: u32,
    pub offset: u64,
}

/// Snapshot of a query for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: String,
    pub sources: Vec<String>,
    pub target: String,
    pub status: QueryStatus,
    /// When the query was submitted (ms since epoch).
    pub created_at: i64,
    /// When the query status was last updated (ms since epoch).
    pub updated_at: i64,
    /// Cause of a `Failed` status
    pub last_error: Option<String>,
    pub cursors: Vec<CursorPosition>,
}

// ---------------------------------------------------------------------------
// Control signal
// ---------------------------------------------------------------------------

/// Signals sent to the tasks of a query via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySignal {
    /// Keep running (or start running).
    Run,
    /// Pause processing.
    Pause,
    /// Stop the query permanently.
    Stop,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Resource limits for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of queries that can be running or paused at once.
    pub max_concurrent_queries: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 64,
        }
    }
}

/// Engine tuning, the `[engine]` section of a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Records read per poll of a partition
    pub batch_size: usize,

    /// Upper bound on how long an idle worker sleeps before polling again
    pub idle_poll_interval_ms: u64,

    pub limits: ResourceLimits,
}

impl EngineConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_poll_interval_ms: 1000,
            limits: ResourceLimits::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared per-query state
// ---------------------------------------------------------------------------

struct StatusState {
    status: QueryStatus,
    updated_at: i64,
    last_error: Option<String>,
}

/// What became of one processed record
#[derive(Debug, Clone, Copy)]
enum Handled {
    Emitted,
    Filtered,
    Dropped,
}

/// State shared between the engine and the tasks of one query
struct QueryShared {
    query_id: String,
    state: Mutex<StatusState>,
    stats: Mutex<QueryStats>,
    cursors: Mutex<BTreeMap<(String, u32), u64>>,
    signal_tx: watch::Sender<QuerySignal>,
}

impl QueryShared {
    /// Move to `next` if the current status is one of `from`
    async fn transition(
        &self,
        from: &[QueryStatus],
        next: QueryStatus,
        error: Option<String>,
    ) -> std::result::Result<QueryStatus, QueryStatus> {
        let mut state = self.state.lock().await;
        if !from.contains(&state.status) {
            return Err(state.status);
        }
        let previous = state.status;
        state.status = next;
        state.updated_at = chrono::Utc::now().timestamp_millis();
        if error.is_some() {
            state.last_error = error;
        }
        Ok(previous)
    }

    async fn fail(&self, err: &SqlError) {
        let active = [QueryStatus::Running, QueryStatus::Paused];
        if self
            .transition(&active, QueryStatus::Failed, Some(err.to_string()))
            .await
            .is_ok()
        {
            error!(query_id = %self.query_id, error = %err, "continuous query failed");
            ACTIVE_QUERIES.dec();
            self.signal_tx.send_replace(QuerySignal::Stop);
        }
    }

    async fn record_stats(&self, record: &Record, handled: Handled) {
        let mut stats = self.stats.lock().await;
        stats.messages_processed += 1;
        stats.last_processed_timestamp = Some(record.timestamp);
        stats.last_active = chrono::Utc::now().timestamp_millis();
        match handled {
            Handled::Emitted => stats.messages_emitted += 1,
            Handled::Filtered => stats.messages_filtered += 1,
            Handled::Dropped => stats.messages_failed += 1,
        }
    }

    async fn cursor_positions(&self) -> Vec<CursorPosition> {
        self.cursors
            .lock()
            .await
            .iter()
            .map(|((stream, partition), offset)| CursorPosition {
                stream: stream.clone(),
                partition: *partition,
                offset: *offset,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// QueryHandle (returned to the caller)
// ---------------------------------------------------------------------------

/// Handle to a submitted query.
#[derive(Clone)]
pub struct QueryHandle {
    /// Unique query identifier.
    pub query_id: String,
    /// Stream the query writes to.
    pub target: String,
    shared: Arc<QueryShared>,
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query_id", &self.query_id)
            .field("target", &self.target)
            .finish()
    }
}

impl QueryHandle {
    /// Retrieve a snapshot of the query statistics.
    pub async fn stats(&self) -> QueryStats {
        self.shared.stats.lock().await.clone()
    }

    pub async fn status(&self) -> QueryStatus {
        self.shared.state.lock().await.status
    }

    /// Next offset of every (source, partition) worker
    pub async fn cursors(&self) -> Vec<CursorPosition> {
        self.shared.cursor_positions().await
    }
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

/// Internal entry stored by the engine.
struct QueryEntry {
    seq: u64,
    definition: QueryDefinition,
    created_at: i64,
    tasks: Vec<JoinHandle<()>>,
    shared: Arc<QueryShared>,
}

impl QueryEntry {
    async fn info(&self, query_id: &str) -> QueryInfo {
        let state = self.shared.state.lock().await;
        QueryInfo {
            query_id: query_id.to_string(),
            sources: self.definition.sources.clone(),
            target: self.definition.target.clone(),
            status: state.status,
            created_at: self.created_at,
            updated_at: state.updated_at,
            last_error: state.last_error.clone(),
            cursors: self.shared.cursor_positions().await,
        }
    }

    async fn references(&self, stream: &str) -> bool {
        let uses = self.definition.target == stream
            || self.definition.sources.iter().any(|s| s == stream);
        uses && self.shared.state.lock().await.status.is_active()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// One (query, source partition) task
struct Worker {
    source_index: usize,
    pipeline: Arc<QueryPipeline>,
    log: Arc<dyn StreamLog>,
    shared: Arc<QueryShared>,
    batch_size: usize,
    idle_poll_interval: Duration,
}

impl Worker {
    async fn run(self, mut cursor: PartitionCursor, mut signal_rx: watch::Receiver<QuerySignal>) {
        let query_id = self.shared.query_id.clone();
        debug!(
            query_id = %query_id,
            stream = %cursor.stream(),
            partition = cursor.partition(),
            offset = cursor.position(),
            "query worker started"
        );

        loop {
            let signal = *signal_rx.borrow_and_update();
            match signal {
                QuerySignal::Stop => break,
                QuerySignal::Pause => {
                    if signal_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                QuerySignal::Run => {}
            }

            let batch = match cursor.poll(self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.shared.fail(&e.into()).await;
                    break;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    waited = cursor.wait() => {
                        if let Err(e) = waited {
                            self.shared.fail(&e.into()).await;
                            break;
                        }
                    }
                    changed = signal_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.idle_poll_interval) => {}
                }
                continue;
            }

            for record in batch {
                if *signal_rx.borrow() != QuerySignal::Run {
                    break;
                }
                let handled = match self.handle(&record, cursor.stream()).await {
                    Ok(handled) => handled,
                    Err(e) => {
                        self.shared.fail(&e).await;
                        return;
                    }
                };
                cursor.advance(&record);
                self.shared
                    .cursors
                    .lock()
                    .await
                    .insert((cursor.stream().to_string(), cursor.partition()), cursor.position());
                self.shared.record_stats(&record, handled).await;
            }
        }

        debug!(
            query_id = %query_id,
            stream = %cursor.stream(),
            partition = cursor.partition(),
            offset = cursor.position(),
            "query worker exited"
        );
    }

    /// Process one record; an error here is fatal for the query
    async fn handle(&self, record: &Record, stream: &str) -> Result<Handled> {
        let query_id = self.shared.query_id.as_str();
        let _timer = QUERY_PROCESSING_SECONDS
            .with_label_values(&[query_id])
            .start_timer();
        QUERY_MESSAGES_PROCESSED_TOTAL
            .with_label_values(&[query_id])
            .inc();

        match self.pipeline.process(self.source_index, record) {
            Ok(Outcome::Emitted(out)) => {
                let target = self.pipeline.target();
                self.log
                    .append(target, out.partition, out.key, Some(out.timestamp), out.value)
                    .await?;
                STREAM_APPENDS_TOTAL.with_label_values(&[target]).inc();
                QUERY_MESSAGES_EMITTED_TOTAL
                    .with_label_values(&[query_id])
                    .inc();
                Ok(Handled::Emitted)
            }
            Ok(Outcome::Filtered) => {
                QUERY_MESSAGES_FILTERED_TOTAL
                    .with_label_values(&[query_id])
                    .inc();
                Ok(Handled::Filtered)
            }
            Err(e) if e.is_record_error() => {
                warn!(
                    query_id = %query_id,
                    stream = %stream,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "dropping record"
                );
                QUERY_MESSAGES_FAILED_TOTAL
                    .with_label_values(&[query_id, e.reason()])
                    .inc();
                Ok(Handled::Dropped)
            }
            Err(e) => Err(e),
        }
    }
}

/// Drops every per-query series, returning how many existed
fn forget_query_metrics(query_id: &str) -> usize {
    let counters = [
        &*QUERY_MESSAGES_PROCESSED_TOTAL,
        &*QUERY_MESSAGES_EMITTED_TOTAL,
        &*QUERY_MESSAGES_FILTERED_TOTAL,
    ];
    let mut removed = 0;
    for counter in counters {
        if counter.remove_label_values(&[query_id]).is_ok() {
            removed += 1;
        }
    }
    if QUERY_PROCESSING_SECONDS
        .remove_label_values(&[query_id])
        .is_ok()
    {
        removed += 1;
    }
    for &reason in SqlError::REASONS {
        if QUERY_MESSAGES_FAILED_TOTAL
            .remove_label_values(&[query_id, reason])
            .is_ok()
        {
            removed += 1;
        }
    }
    removed
}

// ---------------------------------------------------------------------------
// QueryEngine
// ---------------------------------------------------------------------------

/// Runs continuous queries over a stream log.
pub struct QueryEngine {
    catalog: Arc<SchemaCatalog>,
    log: Arc<dyn StreamLog>,
    config: EngineConfig,
    queries: Arc<RwLock<HashMap<String, QueryEntry>>>,
    next_id: Arc<Mutex<u64>>,
    round_robin: AtomicU64,
}

impl QueryEngine {
    /// Create an engine over a catalog and a log
    pub fn new(catalog: Arc<SchemaCatalog>, log: Arc<dyn StreamLog>, config: EngineConfig) -> Self {
        tidewater_observability::init();
        Self {
            catalog,
            log,
            config,
            queries: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
            round_robin: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn log(&self) -> &Arc<dyn StreamLog> {
        &self.log
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- streams ------------------------------------------------------------

    /// Register a stream and create its log partitions
    pub async fn create_stream(&self, definition: StreamDefinition) -> Result<()> {
        for key_field in &definition.key_fields {
            FieldPath::parse(key_field)?;
        }
        if let Some(column) = &definition.timestamp {
            FieldPath::parse(&column.field)?;
        }

        let name = definition.name.clone();
        let partitions = definition.partitions;
        self.catalog.register(definition).await?;
        self.ensure_log(&name, partitions).await
    }

    /// Drop a stream no running or paused query reads or writes
    pub async fn drop_stream(&self, name: &str) -> Result<()> {
        {
            let queries = self.queries.read().await;
            for (query_id, entry) in queries.iter() {
                if entry.references(name).await {
                    return Err(SqlError::StreamInUse {
                        stream: name.to_string(),
                        query_id: query_id.clone(),
                    });
                }
            }
        }

        self.catalog.drop_stream(name).await?;
        match self.log.drop_stream(name).await {
            Ok(()) | Err(tidewater_core::Error::UnknownStream(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create log partitions for every stream the catalog already holds.
    ///
    /// Call once after opening a persisted catalog; returns the number of
    /// streams restored.
    pub async fn restore_streams(&self) -> Result<usize> {
        let streams = self.catalog.list().await;
        for stream in &streams {
            self.ensure_log(&stream.name, stream.partitions).await?;
        }
        if !streams.is_empty() {
            info!(streams = streams.len(), "restored streams from catalog");
        }
        Ok(streams.len())
    }

    pub async fn list_streams(&self) -> Vec<StreamInfo> {
        self.catalog.list().await
    }

    pub async fn describe_stream(&self, name: &str) -> Result<StreamDescription> {
        Ok(self.catalog.describe(name).await?)
    }

    /// Encode `value` with the stream's codec and append it, keyed by the
    /// stream's declared key fields
    pub async fn produce(&self, stream: &str, value: &Value) -> Result<Record> {
        let registered = self.catalog.get(stream).await?;
        let codec = self.catalog.codec(stream).await?;
        let definition = &registered.definition;

        let key_fields = definition
            .key_fields
            .iter()
            .map(|f| FieldPath::parse(f))
            .collect::<Result<Vec<_>>>()?;
        let key = router::key_from_fields(value, &key_fields);

        let partition = match &key {
            Some(k) => router::route(k, definition.partitions),
            None => {
                let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
                (next % definition.partitions as u64) as u32
            }
        };

        let payload = codec.encode(value)?;
        self.produce_raw(stream, partition, key, payload).await
    }

    /// Append an already encoded payload
    pub async fn produce_raw(
        &self,
        stream: &str,
        partition: u32,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<Record> {
        let definition = &self.catalog.get(stream).await?.definition;
        self.ensure_log(stream, definition.partitions).await?;

        let record = self.log.append(stream, partition, key, None, payload).await?;
        STREAM_APPENDS_TOTAL.with_label_values(&[stream]).inc();
        Ok(record)
    }

    /// Create the log of a catalogued stream when the log does not hold it yet,
    /// as after a restart with persisted catalog storage
    async fn ensure_log(&self, stream: &str, partitions: u32) -> Result<()> {
        match self.log.partition_count(stream).await {
            Ok(_) => Ok(()),
            Err(tidewater_core::Error::UnknownStream(_)) => {
                match self.log.create_stream(stream, partitions).await {
                    Ok(()) | Err(tidewater_core::Error::StreamExists(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- queries ------------------------------------------------------------

    /// Submit a new continuous query.
    ///
    /// Creates the target stream when it does not exist, then starts one task
    /// per source partition.
    pub async fn submit_query(&self, definition: QueryDefinition) -> Result<QueryHandle> {
        definition.validate()?;

        // Submissions are serialized so fan-in checks see every earlier target.
        let mut queries = self.queries.write().await;

        let mut active_count = 0;
        for entry in queries.values() {
            if entry.shared.state.lock().await.status.is_active() {
                active_count += 1;
            }
        }
        if active_count >= self.config.limits.max_concurrent_queries {
            return Err(SqlError::MaxQueriesReached(
                self.config.limits.max_concurrent_queries,
            ));
        }

        let seq = {
            let mut next = self.next_id.lock().await;
            let seq = *next;
            *next += 1;
            seq
        };
        let query_id = definition
            .id
            .clone()
            .unwrap_or_else(|| format!("cq-{seq}"));
        if queries.contains_key(&query_id) {
            return Err(SqlError::InvalidQuery(format!(
                "query id {query_id} is already in use"
            )));
        }

        let created_target = if self.catalog.contains(&definition.target).await {
            false
        } else {
            let target = definition.target_definition(&self.catalog).await?;
            info!(
                query_id = %query_id,
                stream = %target.name,
                partitions = target.partitions,
                format = %target.format,
                "creating target stream"
            );
            self.create_stream(target).await?;
            true
        };

        let pipeline = match self.start_pipeline(&definition).await {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                if created_target {
                    self.rollback_target(&query_id, &definition.target).await;
                }
                return Err(e);
            }
        };

        let (signal_tx, _) = watch::channel(QuerySignal::Run);
        let now = chrono::Utc::now().timestamp_millis();
        let shared = Arc::new(QueryShared {
            query_id: query_id.clone(),
            state: Mutex::new(StatusState {
                status: QueryStatus::Running,
                updated_at: now,
                last_error: None,
            }),
            stats: Mutex::new(QueryStats::default()),
            cursors: Mutex::new(BTreeMap::new()),
            signal_tx,
        });

        let mut starts = Vec::new();
        for (source_index, source) in pipeline.sources().iter().enumerate() {
            for partition in 0..source.partitions {
                let offset = match definition.start {
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => self.log.high_watermark(&source.name, partition).await?,
                };
                starts.push((source_index, source.name.clone(), partition, offset));
            }
        }

        let mut tasks = Vec::with_capacity(starts.len());
        for (source_index, stream, partition, offset) in starts {
            shared
                .cursors
                .lock()
                .await
                .insert((stream.clone(), partition), offset);

            let cursor = PartitionCursor::new(self.log.clone(), &stream, partition, offset);
            let worker = Worker {
                source_index,
                pipeline: pipeline.clone(),
                log: self.log.clone(),
                shared: shared.clone(),
                batch_size: self.config.batch_size.max(1),
                idle_poll_interval: self.config.idle_poll_interval(),
            };
            let signal_rx = shared.signal_tx.subscribe();
            tasks.push(tokio::spawn(worker.run(cursor, signal_rx)));
        }

        ACTIVE_QUERIES.inc();
        info!(
            query_id = %query_id,
            sources = ?definition.sources,
            target = %definition.target,
            workers = tasks.len(),
            "continuous query submitted"
        );

        let handle = QueryHandle {
            query_id: query_id.clone(),
            target: definition.target.clone(),
            shared: shared.clone(),
        };
        queries.insert(
            query_id,
            QueryEntry {
                seq,
                definition,
                created_at: now,
                tasks,
                shared,
            },
        );

        Ok(handle)
    }

    /// Drops a target created by a submission that then failed to compile.
    async fn rollback_target(&self, query_id: &str, target: &str) {
        if let Err(e) = self.catalog.drop_stream(target).await {
            warn!(
                query_id = %query_id,
                stream = %target,
                error = %e,
                "failed to roll back target stream registration"
            );
        }
        if let Err(e) = self.log.drop_stream(target).await {
            warn!(
                query_id = %query_id,
                stream = %target,
                error = %e,
                "failed to roll back target stream log"
            );
        }
    }

    async fn start_pipeline(&self, definition: &QueryDefinition) -> Result<QueryPipeline> {
        let pipeline = QueryPipeline::compile(definition, &self.catalog).await?;
        for source in pipeline.sources() {
            self.ensure_log(&source.name, source.partitions).await?;
        }
        self.ensure_log(pipeline.target(), pipeline.target_partitions())
            .await?;
        Ok(pipeline)
    }

    /// Stop a query; returns once every task has exited.
    pub async fn stop_query(&self, query_id: &str) -> Result<()> {
        let tasks = {
            let mut queries = self.queries.write().await;
            let entry = queries
                .get_mut(query_id)
                .ok_or_else(|| SqlError::QueryNotFound(query_id.to_string()))?;

            let active = [QueryStatus::Running, QueryStatus::Paused];
            if entry
                .shared
                .transition(&active, QueryStatus::Stopped, None)
                .await
                .is_ok()
            {
                ACTIVE_QUERIES.dec();
            }
            entry.shared.signal_tx.send_replace(QuerySignal::Stop);
            std::mem::take(&mut entry.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                warn!(query_id = %query_id, error = %e, "query worker did not exit cleanly");
            }
        }

        info!(query_id = %query_id, "query stopped");
        Ok(())
    }

    /// Stop a query if it is still active and forget it.
    ///
    /// Frees its id for reuse and removes its metric series.
    pub async fn remove_query(&self, query_id: &str) -> Result<()> {
        self.stop_query(query_id).await?;
        self.queries
            .write()
            .await
            .remove(query_id)
            .ok_or_else(|| SqlError::QueryNotFound(query_id.to_string()))?;

        let series = forget_query_metrics(query_id);
        info!(query_id = %query_id, series, "query removed");
        Ok(())
    }

    /// Pause a running query.
    pub async fn pause_query(&self, query_id: &str) -> Result<()> {
        let queries = self.queries.read().await;
        let entry = queries
            .get(query_id)
            .ok_or_else(|| SqlError::QueryNotFound(query_id.to_string()))?;

        entry
            .shared
            .transition(&[QueryStatus::Running], QueryStatus::Paused, None)
            .await
            .map_err(|status| {
                SqlError::InvalidQuery(format!(
                    "query {query_id} is not running (status: {status:?})"
                ))
            })?;
        entry.shared.signal_tx.send_replace(QuerySignal::Pause);
        debug!(query_id = %query_id, "query paused");
        Ok(())
    }

    /// Resume a paused query.
    pub async fn resume_query(&self, query_id: &str) -> Result<()> {
        let queries = self.queries.read().await;
        let entry = queries
            .get(query_id)
            .ok_or_else(|| SqlError::QueryNotFound(query_id.to_string()))?;

        entry
            .shared
            .transition(&[QueryStatus::Paused], QueryStatus::Running, None)
            .await
            .map_err(|status| {
                SqlError::InvalidQuery(format!(
                    "query {query_id} is not paused (status: {status:?})"
                ))
            })?;
        entry.shared.signal_tx.send_replace(QuerySignal::Run);
        debug!(query_id = %query_id, "query resumed");
        Ok(())
    }

    /// List all queries in submission order.
    pub async fn list_queries(&self) -> Vec<QueryInfo> {
        let queries = self.queries.read().await;
        let mut entries: Vec<(&String, &QueryEntry)> = queries.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);

        let mut infos = Vec::with_capacity(entries.len());
        for (query_id, entry) in entries {
            infos.push(entry.info(query_id).await);
        }
        infos
    }

    pub async fn query_info(&self, query_id: &str) -> Result<QueryInfo> {
        let queries = self.queries.read().await;
        let entry = queries
            .get(query_id)
            .ok_or_else(|| SqlError::QueryNotFound(query_id.to_string()))?;
        Ok(entry.info(query_id).await)
    }

    /// Retrieve stats for a specific query.
    pub async fn get_stats(&self, query_id: &str) -> Result<QueryStats> {
        let queries = self.queries.read().await;
        let entry = queries
            .get(query_id)
            .ok_or_else(|| SqlError::QueryNotFound(query_id.to_string()))?;
        let stats = entry.shared.stats.lock().await.clone();
        Ok(stats)
    }

    /// Stop every query and wait for all tasks to exit
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.queries.read().await.keys().cloned().collect();
        for query_id in ids {
            if let Err(e) = self.stop_query(&query_id).await {
                warn!(query_id = %query_id, error = %e, "failed to stop query during shutdown");
            }
        }
        info!("query engine shut down");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use tidewater_catalog::{Field, FieldType, Schema};
    use tidewater_core::MemoryStreamLog;

    fn engine_with(limits: ResourceLimits) -> QueryEngine {
        QueryEngine::new(
            Arc::new(SchemaCatalog::in_memory()),
            Arc::new(MemoryStreamLog::new()),
            EngineConfig {
                batch_size: 10,
                idle_poll_interval_ms: 50,
                limits,
            },
        )
    }

    fn default_engine() -> QueryEngine {
        engine_with(ResourceLimits::default())
    }

    fn orders() -> StreamDefinition {
        StreamDefinition::new(
            "ORDERS",
            Schema::new(vec![
                Field::new("id", FieldType::Integer),
                Field::new("customer", FieldType::Text),
            ]),
        )
        .with_partitions(2)
        .with_key_fields(vec!["customer".to_string()])
    }

    fn copy_query(target: &str) -> QueryDefinition {
        QueryDefinition::new("ORDERS", target).project("id", Expr::path("id").unwrap())
    }

    async fn wait_for_processed(engine: &QueryEngine, query_id: &str, n: u64) -> QueryStats {
        for _ in 0..200 {
            let stats = engine.get_stats(query_id).await.unwrap();
            if stats.messages_processed >= n {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("query {query_id} did not process {n} records");
    }

    #[tokio::test]
    async fn test_restore_streams_creates_log_partitions() {
        let catalog = Arc::new(SchemaCatalog::in_memory());
        catalog.register(orders()).await.unwrap();
        let engine = QueryEngine::new(
            catalog,
            Arc::new(MemoryStreamLog::new()),
            EngineConfig::default(),
        );
        assert!(engine.log().partition_count("ORDERS").await.is_err());

        assert_eq!(engine.restore_streams().await.unwrap(), 1);
        assert_eq!(engine.log().partition_count("ORDERS").await.unwrap(), 2);

        // Idempotent
        assert_eq!(engine.restore_streams().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_submit_query_assigns_ids() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();

        let h1 = engine.submit_query(copy_query("A")).await.unwrap();
        let h2 = engine.submit_query(copy_query("B")).await.unwrap();
        assert!(h1.query_id.starts_with("cq-"));
        assert_ne!(h1.query_id, h2.query_id);

        let custom = engine
            .submit_query(copy_query("C").with_id("copy-c"))
            .await
            .unwrap();
        assert_eq!(custom.query_id, "copy-c");

        let clash = engine.submit_query(copy_query("D").with_id("copy-c")).await;
        assert!(matches!(clash, Err(SqlError::InvalidQuery(_))));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_creates_target() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        engine.submit_query(copy_query("IDS")).await.unwrap();

        let desc = engine.describe_stream("IDS").await.unwrap();
        assert_eq!(desc.partitions, 2);
        assert_eq!(desc.columns.len(), 1);
        assert_eq!(engine.log().partition_count("IDS").await.unwrap(), 2);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_submission_removes_created_target() {
        let engine = default_engine();
        let events = StreamDefinition::new(
            "EVENTS",
            Schema::new(vec![Field::new("ts", FieldType::Text)]),
        )
        .with_timestamp("ts[", None);
        assert!(matches!(
            engine.create_stream(events.clone()).await,
            Err(SqlError::InvalidPath { .. })
        ));
        // registered behind the engine's back
        engine.catalog().register(events).await.unwrap();

        let query = QueryDefinition::new("EVENTS", "EVENTS_COPY")
            .project("ts", Expr::path("ts").unwrap());
        let result = engine.submit_query(query).await;
        assert!(matches!(result, Err(SqlError::InvalidPath { .. })));
        assert!(!engine.catalog().contains("EVENTS_COPY").await);
        assert!(engine.log().partition_count("EVENTS_COPY").await.is_err());
        assert!(engine.list_queries().await.is_empty());

        // the rolled back name is free for a query that compiles
        engine.create_stream(orders()).await.unwrap();
        engine.submit_query(copy_query("EVENTS_COPY")).await.unwrap();
        assert_eq!(engine.log().partition_count("EVENTS_COPY").await.unwrap(), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_conflicting_existing_target() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        engine
            .create_stream(StreamDefinition::new(
                "TAKEN",
                Schema::new(vec![Field::new("other", FieldType::Text)]),
            ))
            .await
            .unwrap();

        let conflict = engine.submit_query(copy_query("TAKEN")).await;
        assert!(matches!(conflict, Err(SqlError::DuplicateQueryTarget { .. })));
        assert!(engine.catalog().contains("TAKEN").await);
        assert!(engine.list_queries().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_query() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        let handle = engine.submit_query(copy_query("IDS")).await.unwrap();

        engine.stop_query(&handle.query_id).await.unwrap();
        assert_eq!(handle.status().await, QueryStatus::Stopped);

        // nothing is read after a stop
        engine
            .produce("ORDERS", &Value::structure([("id", Value::Int(1))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().await.messages_processed, 0);

        // stopping twice is harmless
        engine.stop_query(&handle.query_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_query_releases_id_and_metrics() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        let query_id = "removable-ids";
        engine
            .submit_query(copy_query("IDS").with_id(query_id))
            .await
            .unwrap();

        engine
            .produce(
                "ORDERS",
                &Value::structure([("id", Value::Int(1)), ("customer", Value::from("c1"))]),
            )
            .await
            .unwrap();
        wait_for_processed(&engine, query_id, 1).await;
        assert_eq!(
            QUERY_MESSAGES_PROCESSED_TOTAL
                .with_label_values(&[query_id])
                .get(),
            1
        );

        engine.remove_query(query_id).await.unwrap();
        assert!(matches!(
            engine.query_info(query_id).await,
            Err(SqlError::QueryNotFound(_))
        ));
        assert!(engine.list_queries().await.is_empty());
        // already gone from the registry
        assert!(QUERY_MESSAGES_PROCESSED_TOTAL
            .remove_label_values(&[query_id])
            .is_err());
        assert!(QUERY_MESSAGES_EMITTED_TOTAL
            .remove_label_values(&[query_id])
            .is_err());

        // the id can be reused, and a stopped query can be removed too
        let again = engine
            .submit_query(copy_query("IDS").with_id(query_id))
            .await
            .unwrap();
        engine.stop_query(&again.query_id).await.unwrap();
        engine.remove_query(query_id).await.unwrap();

        assert!(matches!(
            engine.remove_query(query_id).await,
            Err(SqlError::QueryNotFound(_))
        ));
        // the target outlives its queries
        assert!(engine.catalog().contains("IDS").await);
    }

    #[tokio::test]
    async fn test_pause_and_resume_query() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        let handle = engine.submit_query(copy_query("IDS")).await.unwrap();
        let qid = handle.query_id.clone();

        engine.pause_query(&qid).await.unwrap();
        assert_eq!(engine.query_info(&qid).await.unwrap().status, QueryStatus::Paused);

        engine
            .produce("ORDERS", &Value::structure([("id", Value::Int(7))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.stats().await.messages_processed, 0);

        engine.resume_query(&qid).await.unwrap();
        assert_eq!(engine.query_info(&qid).await.unwrap().status, QueryStatus::Running);
        let stats = wait_for_processed(&engine, &qid, 1).await;
        assert_eq!(stats.messages_emitted, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        let handle = engine.submit_query(copy_query("IDS")).await.unwrap();
        let qid = handle.query_id.clone();

        assert!(engine.resume_query(&qid).await.is_err());
        engine.stop_query(&qid).await.unwrap();
        assert!(engine.pause_query(&qid).await.is_err());

        assert!(matches!(
            engine.stop_query("nonexistent").await,
            Err(SqlError::QueryNotFound(_))
        ));
        assert!(engine.pause_query("nonexistent").await.is_err());
        assert!(engine.resume_query("nonexistent").await.is_err());
        assert!(engine.get_stats("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_max_concurrent_queries_exceeded() {
        let engine = engine_with(ResourceLimits {
            max_concurrent_queries: 2,
        });
        engine.create_stream(orders()).await.unwrap();

        let h1 = engine.submit_query(copy_query("A")).await.unwrap();
        engine.submit_query(copy_query("B")).await.unwrap();
        let result = engine.submit_query(copy_query("C")).await;
        assert!(matches!(result, Err(SqlError::MaxQueriesReached(2))));

        // a stopped query frees its slot
        engine.stop_query(&h1.query_id).await.unwrap();
        engine.submit_query(copy_query("C")).await.unwrap();

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_stream_in_use() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        let handle = engine.submit_query(copy_query("IDS")).await.unwrap();

        for stream in ["ORDERS", "IDS"] {
            match engine.drop_stream(stream).await {
                Err(SqlError::StreamInUse { query_id, .. }) => {
                    assert_eq!(query_id, handle.query_id)
                }
                other => panic!("expected StreamInUse, got {other:?}"),
            }
        }

        engine.stop_query(&handle.query_id).await.unwrap();
        engine.drop_stream("IDS").await.unwrap();
        assert!(engine.log().partition_count("IDS").await.is_err());
        assert_eq!(engine.list_streams().await.len(), 1);
    }

    #[tokio::test]
    async fn test_produce_routes_by_key_fields() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();

        let value = Value::structure([("id", Value::Int(1)), ("customer", Value::from("acme"))]);
        let first = engine.produce("ORDERS", &value).await.unwrap();
        let second = engine.produce("ORDERS", &value).await.unwrap();

        assert_eq!(first.key, Some(Bytes::from("acme")));
        assert_eq!(first.partition, router::route(b"acme", 2));
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_list_queries_with_cursors() {
        let engine = default_engine();
        engine.create_stream(orders()).await.unwrap();
        let handle = engine.submit_query(copy_query("IDS")).await.unwrap();

        for i in 0..4 {
            engine
                .produce(
                    "ORDERS",
                    &Value::structure([("id", Value::Int(i)), ("customer", Value::from("c"))]),
                )
                .await
                .unwrap();
        }
        let stats = wait_for_processed(&engine, &handle.query_id, 4).await;
        assert_eq!(stats.messages_emitted, 4);
        assert!(stats.last_processed_timestamp.is_some());

        let infos = engine.list_queries().await;
        assert_eq!(infos.len(), 1);
        let partition = router::route(b"c", 2);
        let cursor = infos[0]
            .cursors
            .iter()
            .find(|c| c.partition == partition)
            .unwrap();
        assert_eq!(cursor.offset, 4);
        assert_eq!(infos[0].cursors.len(), 2);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.limits.max_concurrent_queries, 64);
        assert_eq!(config.idle_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_engine_config_from_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            batch_size = 5

            [limits]
            max_concurrent_queries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.idle_poll_interval_ms, 1000);
        assert_eq!(config.limits.max_concurrent_queries, 3);
    }
}
