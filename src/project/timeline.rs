//! Timeline items on disk.
//!
//! Layout of one item, 1-based:
//!
//! ```text
//! <project>/timeline/<index>/
//!     image.png
//!     video.mp4
//!     config.yaml   task_index counter and one section per tool
//!     tasks/<id>/config.yaml
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{Document, YamlDocument};
use crate::task::TaskManager;
use crate::task::manager::TASK_INDEX_KEY;

pub const TIMELINE_DIR: &str = "timeline";
pub const IMAGE_FILE: &str = "image.png";
pub const VIDEO_FILE: &str = "video.mp4";
pub const ITEM_CONFIG_FILE: &str = "config.yaml";
pub const TASKS_DIR: &str = "tasks";

/// Config key naming the tool last applied to the item.
pub const CURRENT_TOOL_KEY: &str = "current_tool";

/// Where an item's files live. Cheap to build for any index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPaths {
    index: usize,
    dir: PathBuf,
}

impl ItemPaths {
    pub fn new(timeline_dir: &Path, index: usize) -> Self {
        Self {
            index,
            dir: timeline_dir.join(index.to_string()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    pub fn video_path(&self) -> PathBuf {
        self.dir.join(VIDEO_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(ITEM_CONFIG_FILE)
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.dir.join(TASKS_DIR)
    }
}

/// One opened timeline item with its config and task manager.
pub struct TimelineItem {
    paths: ItemPaths,
    timeline_dir: PathBuf,
    config: Arc<YamlDocument>,
    tasks: Arc<TaskManager>,
}

impl TimelineItem {
    /// Open (creating the directory if needed) item `index` under `timeline_dir`.
    pub async fn open(timeline_dir: &Path, index: usize) -> Result<Arc<Self>, StoreError> {
        let paths = ItemPaths::new(timeline_dir, index);
        tokio::fs::create_dir_all(paths.dir())
            .await
            .map_err(|source| StoreError::Io {
                path: paths.dir().to_path_buf(),
                source,
            })?;
        let config = Arc::new(YamlDocument::open(paths.config_path()).await);
        let tasks = TaskManager::new(index, paths.tasks_path(), Arc::clone(&config));
        Ok(Arc::new(Self {
            paths,
            timeline_dir: timeline_dir.to_path_buf(),
            config,
            tasks,
        }))
    }

    pub fn index(&self) -> usize {
        self.paths.index
    }

    pub fn paths(&self) -> &ItemPaths {
        &self.paths
    }

    pub fn config(&self) -> &Arc<YamlDocument> {
        &self.config
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn image_path(&self) -> PathBuf {
        self.paths.image_path()
    }

    pub fn video_path(&self) -> PathBuf {
        self.paths.video_path()
    }

    /// Paths of the item before this one; `None` for the first item.
    pub fn previous(&self) -> Option<ItemPaths> {
        let prev = self.index().checked_sub(1).filter(|i| *i >= 1)?;
        Some(ItemPaths::new(&self.timeline_dir, prev))
    }

    /// Whether the item holds media or any tool settings.
    ///
    /// The task counter alone does not count as content.
    pub async fn has_content(&self) -> bool {
        let media = tokio::fs::try_exists(self.image_path()).await.unwrap_or(false)
            || tokio::fs::try_exists(self.video_path()).await.unwrap_or(false);
        media
            || self
                .config
                .snapshot()
                .await
                .keys()
                .any(|k| k != TASK_INDEX_KEY)
    }

    pub async fn get_config_value(&self, key: &str) -> Option<Value> {
        self.config.get(key).await
    }

    /// Store `options` under the tool's own key so tools do not clobber each other.
    pub async fn set_tool_section(&self, tool: &str, options: Document) -> Result<(), StoreError> {
        self.config
            .update(|doc| {
                doc.insert(tool.to_string(), Value::Object(options));
                doc.insert(CURRENT_TOOL_KEY.to_string(), Value::from(tool));
            })
            .await
    }

    /// Replace the item's image with a copy of `source`.
    pub async fn update_image(&self, source: &Path) -> std::io::Result<PathBuf> {
        copy_into(source, self.image_path()).await
    }

    /// Replace the item's video with a copy of `source`.
    pub async fn update_video(&self, source: &Path) -> std::io::Result<PathBuf> {
        copy_into(source, self.video_path()).await
    }
}

async fn copy_into(source: &Path, dest: PathBuf) -> std::io::Result<PathBuf> {
    if source != dest {
        tokio::fs::copy(source, &dest).await?;
    }
    Ok(dest)
}

/// Lazily opened timeline items of one project.
pub struct Timeline {
    dir: PathBuf,
    /// `project.yaml`; holds `timeline_size`.
    project_config: Arc<YamlDocument>,
    items: Mutex<HashMap<usize, Arc<TimelineItem>>>,
}

pub const TIMELINE_SIZE_KEY: &str = "timeline_size";

impl Timeline {
    pub fn new(project_root: &Path, project_config: Arc<YamlDocument>) -> Self {
        Self {
            dir: project_root.join(TIMELINE_DIR),
            project_config,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn size(&self) -> usize {
        self.project_config
            .get_u64(TIMELINE_SIZE_KEY)
            .await
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Open item `index` (1-based). Opening an index past the end grows the timeline.
    pub async fn get_item(&self, index: usize) -> Option<Arc<TimelineItem>> {
        if index == 0 {
            return None;
        }
        let mut items = self.items.lock().await;
        if let Some(item) = items.get(&index) {
            return Some(Arc::clone(item));
        }

        let item = match TimelineItem::open(&self.dir, index).await {
            Ok(item) => item,
            Err(e) => {
                warn!(index, error = %e, "Cannot open timeline item");
                return None;
            }
        };
        if index > self.size().await {
            if let Err(e) = self.project_config.set(TIMELINE_SIZE_KEY, index as u64).await {
                warn!(index, error = %e, "Cannot record timeline size");
            }
        }
        debug!(index, "Timeline item opened");
        items.insert(index, Arc::clone(&item));
        Some(item)
    }

    /// Create the item after the current last one.
    pub async fn add_item(&self) -> Option<Arc<TimelineItem>> {
        let next = self.size().await + 1;
        self.get_item(next).await
    }

    /// Items opened so far, by index.
    pub async fn opened_items(&self) -> Vec<Arc<TimelineItem>> {
        let items = self.items.lock().await;
        let mut list: Vec<_> = items.values().cloned().collect();
        list.sort_by_key(|i| i.index());
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn timeline(dir: &TempDir) -> Timeline {
        let config = Arc::new(YamlDocument::open(dir.path().join("project.yaml")).await);
        Timeline::new(dir.path(), config)
    }

    #[tokio::test]
    async fn items_are_one_based_and_cached() {
        let dir = TempDir::new().unwrap();
        let timeline = timeline(&dir).await;
        assert!(timeline.get_item(0).await.is_none());

        let a = timeline.get_item(1).await.unwrap();
        let b = timeline.get_item(1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(dir.path().join("timeline/1").is_dir());
        assert!(a.previous().is_none());
    }

    #[tokio::test]
    async fn add_item_grows_timeline() {
        let dir = TempDir::new().unwrap();
        let timeline = timeline(&dir).await;
        let first = timeline.add_item().await.unwrap();
        let second = timeline.add_item().await.unwrap();
        assert_eq!(first.index(), 1);
        assert_eq!(second.index(), 2);
        assert_eq!(timeline.size().await, 2);
        assert_eq!(second.previous().unwrap().dir(), first.paths().dir());

        let reopened = YamlDocument::open(dir.path().join("project.yaml")).await;
        assert_eq!(reopened.get_u64(TIMELINE_SIZE_KEY).await, Some(2));
    }

    #[tokio::test]
    async fn counter_alone_is_not_content() {
        let dir = TempDir::new().unwrap();
        let timeline = timeline(&dir).await;
        let item = timeline.get_item(1).await.unwrap();
        item.config().set(TASK_INDEX_KEY, 5).await.unwrap();
        assert!(!item.has_content().await);

        let mut section = Document::new();
        section.insert("prompt".into(), json!("harbor at night"));
        item.set_tool_section("text2img", section).await.unwrap();
        assert!(item.has_content().await);
        assert_eq!(
            item.get_config_value("text2img").await,
            Some(json!({"prompt": "harbor at night"}))
        );
        assert_eq!(item.get_config_value(CURRENT_TOOL_KEY).await, Some(json!("text2img")));
    }

    #[tokio::test]
    async fn update_media_copies_into_item() {
        let dir = TempDir::new().unwrap();
        let timeline = timeline(&dir).await;
        let item = timeline.get_item(3).await.unwrap();
        let src = dir.path().join("output.mp4");
        tokio::fs::write(&src, b"video").await.unwrap();

        let dest = item.update_video(&src).await.unwrap();
        assert_eq!(dest, item.video_path());
        assert_eq!(tokio::fs::read(dest).await.unwrap(), b"video");
        assert!(item.has_content().await);
        assert_eq!(timeline.size().await, 3);
    }
}
