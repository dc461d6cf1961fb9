//! Schema Catalog Service
//!
//! Central registry of stream definitions. Lookups are read-mostly and run
//! concurrently; registration and drop are serialized behind the write lock and
//! reach storage before they become visible.

use crate::codec::StreamCodec;
use crate::error::{CatalogError, Result};
use crate::storage::{CatalogStorage, MemoryCatalogStorage};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct CatalogEntry {
    stream: Arc<RegisteredStream>,
    codec: Arc<StreamCodec>,
}

impl CatalogEntry {
    fn build(stream: RegisteredStream) -> Result<Self> {
        let def = &stream.definition;
        let codec = StreamCodec::new(&def.name, &def.schema, def.format, stream.id)?;
        Ok(Self {
            stream: Arc::new(stream),
            codec: Arc::new(codec),
        })
    }
}

struct CatalogState {
    entries: HashMap<String, CatalogEntry>,
    next_id: i32,
}

/// Schema Catalog
pub struct SchemaCatalog {
    storage: Arc<dyn CatalogStorage>,
    state: RwLock<CatalogState>,
}

impl SchemaCatalog {
    /// Open a catalog, loading every stream already held by `storage`
    pub async fn open(storage: Arc<dyn CatalogStorage>) -> Result<Self> {
        let mut entries = HashMap::new();
        let mut next_id = 1;

        for stream in storage.load_streams().await? {
            next_id = next_id.max(stream.id + 1);
            let name = stream.definition.name.clone();
            entries.insert(name, CatalogEntry::build(stream)?);
        }

        if !entries.is_empty() {
            tracing::info!(streams = entries.len(), "Catalog restored from storage");
        }

        Ok(Self {
            storage,
            state: RwLock::new(CatalogState { entries, next_id }),
        })
    }

    /// Empty catalog backed by memory only
    pub fn in_memory() -> Self {
        Self {
            storage: Arc::new(MemoryCatalogStorage::new()),
            state: RwLock::new(CatalogState {
                entries: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a new stream
    pub async fn register(&self, definition: StreamDefinition) -> Result<StreamHandle> {
        definition.validate()?;

        let mut state = self.state.write().await;
        if state.entries.contains_key(&definition.name) {
            return Err(CatalogError::DuplicateStream(definition.name));
        }

        let stream = RegisteredStream {
            id: state.next_id,
            definition,
            registered_at: chrono::Utc::now().timestamp_millis(),
        };
        let entry = CatalogEntry::build(stream)?;

        self.storage.save_stream(&entry.stream).await?;

        let handle = StreamHandle {
            id: entry.stream.id,
            name: entry.stream.definition.name.clone(),
        };
        state.next_id += 1;
        state.entries.insert(handle.name.clone(), entry);

        tracing::info!(
            id = handle.id,
            stream = %handle.name,
            "Stream registered"
        );

        Ok(handle)
    }

    /// Schema of a registered stream
    pub async fn lookup(&self, name: &str) -> Result<Schema> {
        self.get(name)
            .await
            .map(|stream| stream.definition.schema.clone())
    }

    /// Full registration record of a stream
    pub async fn get(&self, name: &str) -> Result<Arc<RegisteredStream>> {
        self.state
            .read()
            .await
            .entries
            .get(name)
            .map(|e| e.stream.clone())
            .ok_or_else(|| CatalogError::UnknownStream(name.to_string()))
    }

    /// Codec for a stream's payloads
    pub async fn codec(&self, name: &str) -> Result<Arc<StreamCodec>> {
        self.state
            .read()
            .await
            .entries
            .get(name)
            .map(|e| e.codec.clone())
            .ok_or_else(|| CatalogError::UnknownStream(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.entries.contains_key(name)
    }

    /// All streams, ordered by registration
    pub async fn list(&self) -> Vec<StreamInfo> {
        let state = self.state.read().await;
        let mut streams: Vec<&Arc<RegisteredStream>> =
            state.entries.values().map(|e| &e.stream).collect();
        streams.sort_by_key(|s| s.id);

        streams
            .into_iter()
            .map(|s| StreamInfo {
                name: s.definition.name.clone(),
                topic: s.definition.topic().to_string(),
                format: s.definition.format,
                partitions: s.definition.partitions,
            })
            .collect()
    }

    pub async fn describe(&self, name: &str) -> Result<StreamDescription> {
        self.get(name)
            .await
            .map(|stream| StreamDescription::from(&stream.definition))
    }

    /// Remove a stream. Callers check that no query depends on it first.
    pub async fn drop_stream(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.entries.contains_key(name) {
            return Err(CatalogError::UnknownStream(name.to_string()));
        }

        self.storage.delete_stream(name).await?;
        state.entries.remove(name);

        tracing::info!(stream = %name, "Stream dropped");
        Ok(())
    }
}
