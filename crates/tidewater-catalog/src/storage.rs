//! Catalog Storage Layer
//!
//! Persists stream definitions so a restarted engine sees every stream that
//! was registered before it stopped.

use crate::error::{CatalogError, Result};
use crate::types::RegisteredStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Catalog storage trait
#[async_trait]
pub trait CatalogStorage: Send + Sync {
    /// Persist a stream definition
    async fn save_stream(&self, stream: &RegisteredStream) -> Result<()>;

    /// Load every persisted stream
    async fn load_streams(&self) -> Result<Vec<RegisteredStream>>;

    /// Remove a persisted stream; removing an absent stream is not an error
    async fn delete_stream(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryCatalogStorage
// ---------------------------------------------------------------------------

/// In-memory catalog storage
///
/// Nothing survives the process. Suitable for tests and throwaway pipelines.
#[derive(Default)]
pub struct MemoryCatalogStorage {
    streams: RwLock<HashMap<String, RegisteredStream>>,
}

impl MemoryCatalogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStorage for MemoryCatalogStorage {
    async fn save_stream(&self, stream: &RegisteredStream) -> Result<()> {
        self.streams
            .write()
            .await
            .insert(stream.definition.name.clone(), stream.clone());
        Ok(())
    }

    async fn load_streams(&self) -> Result<Vec<RegisteredStream>> {
        let mut streams: Vec<RegisteredStream> =
            self.streams.read().await.values().cloned().collect();
        streams.sort_by_key(|s| s.id);
        Ok(streams)
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        self.streams.write().await.remove(name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileCatalogStorage
// ---------------------------------------------------------------------------

/// A [`CatalogStorage`] that writes one JSON document per stream into a
/// directory. Writes are atomic: data is first written to a `.tmp` file and
/// then renamed into place.
pub struct FileCatalogStorage {
    directory: PathBuf,
}

impl FileCatalogStorage {
    /// Create a new file-based catalog storage.
    ///
    /// The directory is created if it does not already exist.
    pub fn new(directory: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory).map_err(|e| {
            CatalogError::StorageError(format!(
                "failed to create catalog directory {}: {e}",
                directory.display()
            ))
        })?;
        Ok(Self { directory })
    }

    /// Stream names may contain characters that are not valid in file names
    fn file_stem(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_string()
                } else {
                    format!("%{:02X}", c as u32)
                }
            })
            .collect()
    }

    fn stream_path(&self, name: &str) -> PathBuf {
        self.directory
            .join(format!("{}.stream.json", Self::file_stem(name)))
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.directory
            .join(format!("{}.stream.json.tmp", Self::file_stem(name)))
    }
}

#[async_trait]
impl CatalogStorage for FileCatalogStorage {
    async fn save_stream(&self, stream: &RegisteredStream) -> Result<()> {
        let name = &stream.definition.name;
        let data = serde_json::to_vec_pretty(stream)?;

        let tmp = self.tmp_path(name);
        let final_path = self.stream_path(name);

        tokio::fs::write(&tmp, &data).await.map_err(|e| {
            CatalogError::StorageError(format!("failed to write tmp catalog file: {e}"))
        })?;

        tokio::fs::rename(&tmp, &final_path).await.map_err(|e| {
            CatalogError::StorageError(format!("failed to rename catalog file: {e}"))
        })?;

        debug!(stream = %name, bytes = data.len(), "stream definition saved");
        Ok(())
    }

    async fn load_streams(&self) -> Result<Vec<RegisteredStream>> {
        let mut streams = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.directory).await.map_err(|e| {
            CatalogError::StorageError(format!("failed to read catalog directory: {e}"))
        })?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| {
            CatalogError::StorageError(format!("failed to read directory entry: {e}"))
        })? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.ends_with(".stream.json") {
                continue;
            }
            let data = tokio::fs::read(entry.path()).await?;
            let stream: RegisteredStream = serde_json::from_slice(&data).map_err(|e| {
                CatalogError::StorageError(format!("corrupt catalog file {file_name}: {e}"))
            })?;
            streams.push(stream);
        }

        streams.sort_by_key(|s| s.id);
        Ok(streams)
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        let path = self.stream_path(name);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(|e| {
                CatalogError::StorageError(format!("failed to delete catalog file: {e}"))
            })?;
        }
        Ok(())
    }
}
