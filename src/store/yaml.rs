//! YAML-backed key-value documents.
//!
//! Task state files, timeline item configs and `project.yaml` all share this
//! format: a single top-level mapping of string keys to arbitrary values.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::StoreError;

/// Top-level mapping of a YAML document.
pub type Document = Map<String, Value>;

/// Read and parse a YAML file. Returns `Ok(None)` when the file is missing.
pub async fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::Yaml {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize `value` and write it to `path`, creating parent directories.
///
/// Writes go through a sibling temp file and a rename so readers never see a
/// half-written document.
pub async fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_yaml::to_string(value).map_err(|source| StoreError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, body).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// A YAML document cached in memory and flushed on every write.
///
/// Single writer per document: writes hold the lock across the flush.
pub struct YamlDocument {
    path: PathBuf,
    data: RwLock<Document>,
}

impl YamlDocument {
    /// Open a document. A missing or unreadable file starts out empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = read_or_empty(&path).await;
        Self {
            path,
            data: RwLock::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.read().await.get(key).and_then(Value::as_u64)
    }

    pub async fn snapshot(&self) -> Document {
        self.data.read().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// Set one key and flush.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let value = value.into();
        self.update(|doc| {
            doc.insert(key.to_string(), value);
        })
        .await
    }

    /// Mutate the document and flush. The closure's return value is passed through.
    pub async fn update<R: Send>(
        &self,
        f: impl FnOnce(&mut Document) -> R + Send,
    ) -> Result<R, StoreError> {
        let mut data = self.data.write().await;
        let out = f(&mut data);
        save_yaml(&self.path, &*data).await?;
        Ok(out)
    }

    /// Re-read the file, discarding the cached copy.
    pub async fn reload(&self) {
        let fresh = read_or_empty(&self.path).await;
        *self.data.write().await = fresh;
    }
}

async fn read_or_empty(path: &Path) -> Document {
    match load_yaml::<Document>(path).await {
        Ok(doc) => doc.unwrap_or_default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable YAML document, starting empty");
            Document::new()
        }
    }
}
