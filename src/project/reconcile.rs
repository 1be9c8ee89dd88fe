//! Folding finished tasks back into project state.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::comfy::ModelResult;
use crate::error::ReconcileError;
use crate::project::timeline::TimelineItem;
use crate::store::{Document, ResourceStore};
use crate::task::{Task, TaskResult, TaskStatus};

pub const IMAGE_RESOURCE_KEY: &str = "image_resource_path";
pub const VIDEO_RESOURCE_KEY: &str = "video_resource_path";
pub const RESOURCES_KEY: &str = "resources";

/// Registers outputs as resources and rewrites task and item state.
pub struct ResultReconciler {
    resources: Arc<dyn ResourceStore>,
}

impl ResultReconciler {
    pub fn new(resources: Arc<dyn ResourceStore>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &Arc<dyn ResourceStore> {
        &self.resources
    }

    /// Apply `result` to its task and to `item`.
    ///
    /// On success the output is registered once (a second call reuses the
    /// recorded resource), the task gets its resource pointers and
    /// `status: success`, the media is copied into the item and the item's
    /// section for this tool is replaced by the full task options. On failure
    /// the task ends in `status: error` with the reason and nothing is
    /// registered.
    pub async fn reconcile(
        &self,
        item: &TimelineItem,
        result: &TaskResult,
    ) -> Result<(), ReconcileError> {
        let task = &result.task;

        let (media, key) = match &result.result {
            ModelResult::Failed(reason) => {
                warn!(item = item.index(), task_id = %task.id(), reason = %reason, "Task failed");
                if task.status().await != Some(TaskStatus::Error) {
                    task.fail(reason).await?;
                }
                return Ok(());
            }
            ModelResult::Image(path) => (path.as_path(), IMAGE_RESOURCE_KEY),
            ModelResult::Video(path) => (path.as_path(), VIDEO_RESOURCE_KEY),
        };

        let relative = self.register(item, task, media, key).await?;

        task.update(|o| o.set("percent", 100)).await?;
        if task.status().await != Some(TaskStatus::Success) {
            task.transition(TaskStatus::Success).await?;
        }

        if key == IMAGE_RESOURCE_KEY {
            item.update_image(media).await?;
        } else {
            item.update_video(media).await?;
        }

        let options = task.options().await;
        let tool = options.tool().to_string();
        item.set_tool_section(&tool, options.into_map()).await?;

        info!(item = item.index(), task_id = %task.id(), resource = %relative, "Task result reconciled");
        Ok(())
    }

    async fn register(
        &self,
        item: &TimelineItem,
        task: &Task,
        media: &Path,
        key: &str,
    ) -> Result<String, ReconcileError> {
        let existing = task.options().await.get_str(key).map(str::to_owned);
        if let Some(relative) = existing {
            if tokio::fs::try_exists(self.resources.resolve(&relative))
                .await
                .unwrap_or(false)
            {
                return Ok(relative);
            }
        }

        let options = task.options().await;
        let mut metadata = Document::new();
        metadata.insert("tool".into(), Value::from(options.tool()));
        metadata.insert("prompt".into(), Value::from(options.prompt()));
        metadata.insert("timeline_index".into(), Value::from(item.index() as u64));

        let source_id = format!("{}/{}", item.index(), task.id());
        let resource = self
            .resources
            .add_resource(media, "task", &source_id, metadata)
            .await?;
        let relative = resource.relative_path;

        task.update(|o| {
            o.set(key, relative.as_str());
            let mut list = match o.remove(RESOURCES_KEY) {
                Some(Value::Array(list)) => list,
                _ => Vec::new(),
            };
            let entry = Value::from(relative.as_str());
            if !list.contains(&entry) {
                list.push(entry);
            }
            o.set(RESOURCES_KEY, list);
        })
        .await?;
        Ok(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileResourceStore;
    use crate::task::TaskOptions;
    use crate::store::load_yaml;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (ResultReconciler, Arc<TimelineItem>, Arc<Task>) {
        let reconciler = ResultReconciler::new(Arc::new(FileResourceStore::new(dir.path())));
        let item = TimelineItem::open(&dir.path().join("timeline"), 1).await.unwrap();
        let task = item
            .tasks()
            .create_task(TaskOptions::new().with("tool", "text2img").with("prompt", "dune"))
            .await
            .unwrap();
        task.transition(TaskStatus::Running).await.unwrap();
        (reconciler, item, task)
    }

    #[tokio::test]
    async fn image_result_is_registered_and_persisted() {
        let dir = TempDir::new().unwrap();
        let (reconciler, item, task) = setup(&dir).await;
        let output = task.path().join("output.png");
        tokio::fs::write(&output, b"png").await.unwrap();

        let result = TaskResult::new(Arc::clone(&task), ModelResult::Image(output));
        reconciler.reconcile(&item, &result).await.unwrap();

        let state: TaskOptions = load_yaml(task.config_path()).await.unwrap().unwrap();
        let relative = state.get_str(IMAGE_RESOURCE_KEY).unwrap().to_string();
        assert!(dir.path().join(&relative).exists());
        assert_eq!(state.status(), Some(TaskStatus::Success));
        assert_eq!(state.percent(), 100);
        assert_eq!(state.get(RESOURCES_KEY), Some(&serde_json::json!([relative])));

        assert_eq!(tokio::fs::read(item.image_path()).await.unwrap(), b"png");
        let section = item.get_config_value("text2img").await.unwrap();
        assert_eq!(section[IMAGE_RESOURCE_KEY], Value::from(relative.as_str()));
    }

    #[tokio::test]
    async fn reconciling_twice_registers_once() {
        let dir = TempDir::new().unwrap();
        let (reconciler, item, task) = setup(&dir).await;
        let output = task.path().join("output.png");
        tokio::fs::write(&output, b"png").await.unwrap();

        let result = TaskResult::new(Arc::clone(&task), ModelResult::Image(output));
        reconciler.reconcile(&item, &result).await.unwrap();
        reconciler.reconcile(&item, &result).await.unwrap();

        let store = FileResourceStore::new(dir.path());
        assert_eq!(store.list().await.unwrap().len(), 1);
        let resources = task.options().await.get(RESOURCES_KEY).cloned().unwrap();
        assert_eq!(resources.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_records_error_without_resources() {
        let dir = TempDir::new().unwrap();
        let (reconciler, item, task) = setup(&dir).await;

        let result = TaskResult::new(Arc::clone(&task), ModelResult::Failed("timeout".into()));
        reconciler.reconcile(&item, &result).await.unwrap();

        let state: TaskOptions = load_yaml(task.config_path()).await.unwrap().unwrap();
        assert_eq!(state.status(), Some(TaskStatus::Error));
        assert_eq!(state.error(), Some("timeout"));
        assert!(state.get(IMAGE_RESOURCE_KEY).is_none());
        assert!(!dir.path().join("resources").exists());
        assert!(item.get_config_value("text2img").await.is_none());
    }
}
