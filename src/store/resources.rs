//! Managed project resources.
//!
//! Generated media is copied into `<project>/resources/<kind>/` and recorded
//! in `resources/index.yaml` so the rest of the project can refer to it by a
//! stable project-relative path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::StoreError;
use crate::store::yaml::{Document, load_yaml, save_yaml};

/// Kind of media a resource holds, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaType {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "bmp" | "gif" => Self::Image,
            "mp4" | "mov" | "webm" | "mkv" | "avi" => Self::Video,
            "wav" | "mp3" | "flac" | "ogg" | "m4a" => Self::Audio,
            _ => Self::Other,
        }
    }

    /// Sub-directory of `resources/` this kind lives in.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }
}

/// A registered resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// File name inside the kind directory.
    pub name: String,
    /// Path relative to the project root, e.g. `resources/images/output_1.png`.
    pub relative_path: String,
    pub media_type: MediaType,
    /// What produced it (`task`, `import`, ...).
    pub source_type: String,
    pub source_id: String,
    #[serde(default)]
    pub metadata: Document,
    pub created_at: DateTime<Utc>,
}

/// Registers files as managed resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Copy `source` into managed storage and record it.
    async fn add_resource(
        &self,
        source: &Path,
        source_type: &str,
        source_id: &str,
        metadata: Document,
    ) -> Result<Resource, StoreError>;

    /// Absolute path of a project-relative resource path.
    fn resolve(&self, relative_path: &str) -> PathBuf;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResourceIndex {
    #[serde(default)]
    resources: Vec<Resource>,
}

/// File-system backed resource store rooted at a project directory.
pub struct FileResourceStore {
    project_root: PathBuf,
    /// Serializes index read-modify-write.
    index_lock: Mutex<()>,
}

impl FileResourceStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            index_lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.project_root.join("resources").join("index.yaml")
    }

    /// All recorded resources, oldest first.
    pub async fn list(&self) -> Result<Vec<Resource>, StoreError> {
        let index: Option<ResourceIndex> = load_yaml(&self.index_path()).await?;
        Ok(index.unwrap_or_default().resources)
    }
}

/// First name of the form `stem.ext`, `stem_1.ext`, `stem_2.ext`... not present in `dir`.
async fn unique_name(dir: &Path, source: &Path) -> String {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("resource");
    let ext = source.extension().and_then(|e| e.to_str());
    let candidate = |n: u32| {
        let base = if n == 0 {
            stem.to_string()
        } else {
            format!("{stem}_{n}")
        };
        match ext {
            Some(ext) => format!("{base}.{ext}"),
            None => base,
        }
    };

    let mut n = 0;
    loop {
        let name = candidate(n);
        if !fs::try_exists(dir.join(&name)).await.unwrap_or(false) {
            return name;
        }
        n += 1;
    }
}

#[async_trait]
impl ResourceStore for FileResourceStore {
    async fn add_resource(
        &self,
        source: &Path,
        source_type: &str,
        source_id: &str,
        metadata: Document,
    ) -> Result<Resource, StoreError> {
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(StoreError::NotFound(source.to_path_buf()));
        }

        let _guard = self.index_lock.lock().await;

        let media_type = MediaType::from_path(source);
        let dir = self.project_root.join("resources").join(media_type.dir_name());
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let name = unique_name(&dir, source).await;
        let dest = dir.join(&name);
        fs::copy(source, &dest).await.map_err(|e| StoreError::Io {
            path: dest.clone(),
            source: e,
        })?;

        let resource = Resource {
            relative_path: format!("resources/{}/{}", media_type.dir_name(), name),
            name,
            media_type,
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
            metadata,
            created_at: Utc::now(),
        };

        let index_path = self.index_path();
        let mut index: ResourceIndex = load_yaml(&index_path).await?.unwrap_or_default();
        index.resources.push(resource.clone());
        save_yaml(&index_path, &index).await?;

        info!(path = %resource.relative_path, source_type, source_id, "Resource added");
        Ok(resource)
    }

    fn resolve(&self, relative_path: &str) -> PathBuf {
        self.project_root.join(relative_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn media_type_by_extension() {
        assert_eq!(MediaType::from_path(Path::new("a/output.PNG")), MediaType::Image);
        assert_eq!(MediaType::from_path(Path::new("output.mp4")), MediaType::Video);
        assert_eq!(MediaType::from_path(Path::new("voice.wav")), MediaType::Audio);
        assert_eq!(MediaType::from_path(Path::new("notes")), MediaType::Other);
    }

    #[tokio::test]
    async fn add_copies_and_indexes() {
        let project = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("output.png");
        tokio::fs::write(&src, b"png-bytes").await.unwrap();

        let store = FileResourceStore::new(project.path());
        let first = store
            .add_resource(&src, "task", "1", Document::new())
            .await
            .unwrap();
        let second = store
            .add_resource(&src, "task", "2", Document::new())
            .await
            .unwrap();

        assert_eq!(first.relative_path, "resources/images/output.png");
        assert_eq!(second.relative_path, "resources/images/output_1.png");
        assert!(store.resolve(&second.relative_path).exists());

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].source_id, "2");
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let project = TempDir::new().unwrap();
        let store = FileResourceStore::new(project.path());
        let err = store
            .add_resource(&project.path().join("ghost.png"), "task", "1", Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
