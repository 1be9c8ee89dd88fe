//! Task data model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::comfy::ModelResult;
use crate::error::{StoreError, TaskError};
use crate::store::{Document, load_yaml, save_yaml};
use crate::task::state::TaskStatus;

/// Name of the state file inside every task directory.
pub const TASK_CONFIG_FILE: &str = "config.yaml";

pub const DEFAULT_TOOL: &str = "text2img";
pub const DEFAULT_MODEL: &str = "comfy_ui";

/// Free-form job parameters plus the task's persisted state keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskOptions(Document);

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Document) -> Self {
        Self(map)
    }

    /// Builder-style setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &Document {
        &self.0
    }

    pub fn into_map(self) -> Document {
        self.0
    }

    pub fn tool(&self) -> &str {
        self.get_str("tool").unwrap_or(DEFAULT_TOOL)
    }

    pub fn model(&self) -> &str {
        self.get_str("model").unwrap_or(DEFAULT_MODEL)
    }

    pub fn prompt(&self) -> &str {
        self.get_str("prompt").unwrap_or("")
    }

    pub fn input_image_path(&self) -> Option<PathBuf> {
        self.get_str("input_image_path")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn timeline_index(&self) -> Option<usize> {
        self.0
            .get("timeline_index")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.get_str("status").and_then(TaskStatus::parse)
    }

    pub fn percent(&self) -> u8 {
        self.0
            .get("percent")
            .and_then(Value::as_u64)
            .map_or(0, |p| p.min(100) as u8)
    }

    pub fn log(&self) -> &str {
        self.get_str("log").unwrap_or("")
    }

    pub fn error(&self) -> Option<&str> {
        self.get_str("error")
    }
}

/// One submitted generation job.
///
/// The id is the name of the task directory. Options are mirrored to
/// `<path>/config.yaml` on every change.
#[derive(Debug)]
pub struct Task {
    id: String,
    path: PathBuf,
    config_path: PathBuf,
    options: RwLock<TaskOptions>,
}

impl Task {
    pub fn new(path: impl Into<PathBuf>, options: TaskOptions) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            id,
            config_path: path.join(TASK_CONFIG_FILE),
            path,
            options: RwLock::new(options),
        }
    }

    /// Open an existing task directory. A missing or corrupt state file gives empty options.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config_path = path.join(TASK_CONFIG_FILE);
        let options = match load_yaml::<TaskOptions>(&config_path).await {
            Ok(opts) => opts.unwrap_or_default(),
            Err(e) => {
                debug!(path = %config_path.display(), error = %e, "Unreadable task state, using empty options");
                TaskOptions::default()
            }
        };
        Self::new(path, options)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn numeric_id(&self) -> Option<u64> {
        self.id.parse().ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn options(&self) -> TaskOptions {
        self.options.read().await.clone()
    }

    pub async fn tool(&self) -> String {
        self.options.read().await.tool().to_string()
    }

    pub async fn status(&self) -> Option<TaskStatus> {
        self.options.read().await.status()
    }

    /// Write the current options to the state file.
    pub async fn save(&self) -> Result<(), StoreError> {
        let options = self.options.read().await;
        save_yaml(&self.config_path, &*options).await
    }

    /// Mutate options and flush in one step.
    pub async fn update<R: Send>(
        &self,
        f: impl FnOnce(&mut TaskOptions) -> R + Send,
    ) -> Result<R, StoreError> {
        let mut options = self.options.write().await;
        let out = f(&mut options);
        save_yaml(&self.config_path, &*options).await?;
        Ok(out)
    }

    /// Record a progress tick. Flushed immediately.
    pub async fn update_progress(&self, percent: u8, log: &str) -> Result<(), StoreError> {
        self.update(|o| {
            o.set("percent", percent);
            o.set("log", log);
        })
        .await
    }

    /// Move to `to`, rejecting transitions the state machine forbids.
    ///
    /// A task with no recorded status counts as `created`.
    pub async fn transition(&self, to: TaskStatus) -> Result<(), TaskError> {
        let mut options = self.options.write().await;
        let from = options.status().unwrap_or(TaskStatus::Created);
        if !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        options.set("status", to.as_str());
        save_yaml(&self.config_path, &*options).await?;
        Ok(())
    }

    /// Move to `error` and record the reason.
    pub async fn fail(&self, reason: &str) -> Result<(), TaskError> {
        self.transition(TaskStatus::Error).await?;
        self.update(|o| o.set("error", reason)).await?;
        Ok(())
    }

    /// Replace in-memory options with the state file's contents.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let fresh: Option<TaskOptions> = load_yaml(&self.config_path).await?;
        *self.options.write().await = fresh.unwrap_or_default();
        Ok(())
    }
}

/// A finished task paired with what the backend produced.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Arc<Task>,
    pub result: ModelResult,
}

impl TaskResult {
    pub fn new(task: Arc<Task>, result: ModelResult) -> Self {
        Self { task, result }
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.result.image_path()
    }

    pub fn video_path(&self) -> Option<&Path> {
        self.result.video_path()
    }

    pub async fn timeline_index(&self) -> Option<usize> {
        self.task.options.read().await.timeline_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn option_defaults() {
        let opts = TaskOptions::new();
        assert_eq!(opts.tool(), "text2img");
        assert_eq!(opts.model(), "comfy_ui");
        assert_eq!(opts.prompt(), "");
        assert_eq!(opts.percent(), 0);
        assert!(opts.input_image_path().is_none());
    }

    #[test]
    fn options_serialize_flat() {
        let opts = TaskOptions::new()
            .with("tool", "img2video")
            .with("timeline_index", 3);
        assert_eq!(
            serde_json::to_value(&opts).unwrap(),
            json!({"tool": "img2video", "timeline_index": 3})
        );
        assert_eq!(opts.timeline_index(), Some(3));
    }

    #[tokio::test]
    async fn transitions_are_persisted() {
        let dir = TempDir::new().unwrap();
        let task = Task::new(dir.path().join("7"), TaskOptions::new().with("prompt", "x"));
        assert_eq!(task.id(), "7");
        assert_eq!(task.numeric_id(), Some(7));

        task.save().await.unwrap();
        task.transition(TaskStatus::Queued).await.unwrap();
        task.transition(TaskStatus::Running).await.unwrap();
        task.update_progress(40, "Node 3 progress: 40%").await.unwrap();

        let reopened = Task::open(dir.path().join("7")).await;
        let opts = reopened.options().await;
        assert_eq!(opts.status(), Some(TaskStatus::Running));
        assert_eq!(opts.percent(), 40);
        assert_eq!(opts.prompt(), "x");
    }

    #[tokio::test]
    async fn illegal_transition_rejected() {
        let dir = TempDir::new().unwrap();
        let task = Task::new(dir.path().join("1"), TaskOptions::new());
        let err = task.transition(TaskStatus::Success).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn fail_records_reason() {
        let dir = TempDir::new().unwrap();
        let task = Task::new(dir.path().join("2"), TaskOptions::new().with("status", "running"));
        task.fail("timeout").await.unwrap();
        task.reload().await.unwrap();
        let opts = task.options().await;
        assert_eq!(opts.status(), Some(TaskStatus::Error));
        assert_eq!(opts.error(), Some("timeout"));
    }

    #[tokio::test]
    async fn corrupt_state_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let task_dir = dir.path().join("4");
        tokio::fs::create_dir_all(&task_dir).await.unwrap();
        tokio::fs::write(task_dir.join(TASK_CONFIG_FILE), "{{{").await.unwrap();
        let task = Task::open(&task_dir).await;
        assert!(task.options().await.as_map().is_empty());
    }
}
