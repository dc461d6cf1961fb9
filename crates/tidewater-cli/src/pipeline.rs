//! Engine setup and the batch run behind `tidewater run`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tidewater_catalog::{CatalogError, FileCatalogStorage, SchemaCatalog};
use tidewater_core::{MemoryStreamLog, Record, Value};
use tidewater_sql::{QueryEngine, QueryHandle, QueryStatus, SqlError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::input::{read_ndjson, Input};

const READ_CHUNK: usize = 1000;
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Build an engine over the configured catalog and declare every stream.
///
/// Streams already present in a persisted catalog keep their stored
/// definition.
pub async fn build_engine(config: &Config) -> Result<QueryEngine> {
    let catalog = match &config.catalog_dir {
        Some(dir) => {
            let storage = FileCatalogStorage::new(dir.clone())
                .with_context(|| format!("Failed to open catalog directory {}", dir.display()))?;
            SchemaCatalog::open(Arc::new(storage))
                .await
                .context("Failed to load persisted catalog")?
        }
        None => SchemaCatalog::in_memory(),
    };

    let engine = QueryEngine::new(
        Arc::new(catalog),
        Arc::new(MemoryStreamLog::new()),
        config.engine.clone(),
    );
    engine.restore_streams().await?;

    for stream in &config.streams {
        match engine.create_stream(stream.clone()).await {
            Ok(()) => debug!(stream = %stream.name, "stream created"),
            Err(SqlError::Catalog(CatalogError::DuplicateStream(_))) => {
                let existing = engine.catalog().get(&stream.name).await?;
                if existing.definition != *stream {
                    warn!(
                        stream = %stream.name,
                        "declared definition differs from the persisted one; keeping persisted"
                    );
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create stream {}", stream.name))
            }
        }
    }
    Ok(engine)
}

/// Submit every configured query in declaration order
pub async fn submit_queries(engine: &QueryEngine, config: &Config) -> Result<Vec<QueryHandle>> {
    let mut handles = Vec::with_capacity(config.queries.len());
    for (i, query) in config.queries.iter().enumerate() {
        let handle = engine.submit_query(query.clone()).await.with_context(|| {
            format!(
                "Failed to submit query #{} ({} -> {})",
                i + 1,
                query.sources.join(", "),
                query.target
            )
        })?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Produce every document of an input file; returns the number appended
pub async fn feed(engine: &QueryEngine, input: &Input) -> Result<usize> {
    let values = read_ndjson(&input.path)?;
    feed_values(engine, &input.stream, &values).await
}

pub async fn feed_values(engine: &QueryEngine, stream: &str, values: &[Value]) -> Result<usize> {
    for (i, value) in values.iter().enumerate() {
        engine
            .produce(stream, value)
            .await
            .with_context(|| format!("Failed to produce record {} to {}", i + 1, stream))?;
    }
    info!(stream = %stream, records = values.len(), "input produced");
    Ok(values.len())
}

/// Wait until every running query has read its sources up to their high
/// watermarks, or until `timeout` passes. Returns whether the queries drained.
pub async fn drain(engine: &QueryEngine, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        // Appends that land during the check could be missed by a query
        // checked earlier in the pass, so the log must not move across it.
        let before = total_appended(engine).await?;
        let caught_up = caught_up(engine).await?;
        let after = total_appended(engine).await?;
        if caught_up && before == after {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            warn!(timeout_ms = timeout.as_millis() as u64, "queries did not drain in time");
            return Ok(false);
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

async fn total_appended(engine: &QueryEngine) -> Result<u64> {
    let mut total = 0;
    for stream in engine.list_streams().await {
        for partition in 0..stream.partitions {
            total += engine.log().high_watermark(&stream.name, partition).await?;
        }
    }
    Ok(total)
}

async fn caught_up(engine: &QueryEngine) -> Result<bool> {
    for info in engine.list_queries().await {
        if info.status != QueryStatus::Running {
            continue;
        }
        for source in &info.sources {
            let partitions = engine.log().partition_count(source).await?;
            for partition in 0..partitions {
                let high_watermark = engine.log().high_watermark(source, partition).await?;
                let offset = info
                    .cursors
                    .iter()
                    .find(|c| c.stream == *source && c.partition == partition)
                    .map(|c| c.offset)
                    .unwrap_or(0);
                if offset < high_watermark {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Every record of a stream with its decoded value, partition by partition
pub async fn read_stream(engine: &QueryEngine, stream: &str) -> Result<Vec<(Record, Value)>> {
    let codec = engine.catalog().codec(stream).await?;
    let partitions = engine.log().partition_count(stream).await?;

    let mut out = Vec::new();
    for partition in 0..partitions {
        let mut offset = 0;
        loop {
            let batch = engine
                .log()
                .read(stream, partition, offset, READ_CHUNK)
                .await?;
            if batch.is_empty() {
                break;
            }
            for record in batch {
                offset = record.offset + 1;
                let value = codec.decode(&record.value).with_context(|| {
                    format!(
                        "Failed to decode {} partition {} offset {}",
                        stream, record.partition, record.offset
                    )
                })?;
                out.push((record, value));
            }
        }
    }
    Ok(out)
}
