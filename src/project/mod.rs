//! A project: `project.yaml`, its timeline, and the services tasks use.

pub mod reconcile;
pub mod timeline;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::comfy::{ComfyUiModel, GenerationModel};
use crate::config::PipelineConfig;
use crate::error::{Error, StoreError, ToolError};
use crate::store::{FileResourceStore, ResourceStore, YamlDocument};
use crate::task::{TaskEvent, TaskOptions};
use crate::tools::{FfmpegFrameExtractor, FrameExtractor, ToolDeps, ToolRegistry};

pub use reconcile::ResultReconciler;
pub use timeline::{ItemPaths, Timeline, TimelineItem};

pub const PROJECT_CONFIG_FILE: &str = "project.yaml";
pub const TIMELINE_INDEX_KEY: &str = "timeline_index";

const EVENT_CAPACITY: usize = 512;

/// A task event tagged with the item it came from.
#[derive(Debug, Clone)]
pub struct ProjectEvent {
    pub item: usize,
    pub event: TaskEvent,
}

/// External collaborators a project runs with.
pub struct ProjectDeps {
    pub model: Arc<dyn GenerationModel>,
    pub frames: Arc<dyn FrameExtractor>,
    pub resources: Arc<dyn ResourceStore>,
}

impl ProjectDeps {
    /// ComfyUI generation, ffmpeg frame grabs and file resources under `root`.
    pub fn comfyui(config: &PipelineConfig, root: &Path) -> Self {
        Self {
            model: Arc::new(ComfyUiModel::new(config.clone())),
            frames: Arc::new(FfmpegFrameExtractor::new(config.ffmpeg_path.clone())),
            resources: Arc::new(FileResourceStore::new(root)),
        }
    }
}

pub struct Project {
    root: PathBuf,
    config: Arc<YamlDocument>,
    timeline: Timeline,
    registry: ToolRegistry,
    deps: ToolDeps,
    /// Items whose tools are attached and whose events are forwarded.
    wired: Mutex<HashSet<usize>>,
    events: broadcast::Sender<ProjectEvent>,
}

impl Project {
    /// Open the project at `root` with the ComfyUI backend.
    pub async fn open(root: impl Into<PathBuf>, config: &PipelineConfig) -> Arc<Self> {
        let root = root.into();
        let deps = ProjectDeps::comfyui(config, &root);
        Self::open_with(root, deps, ToolRegistry::builtin()).await
    }

    pub async fn open_with(
        root: impl Into<PathBuf>,
        deps: ProjectDeps,
        registry: ToolRegistry,
    ) -> Arc<Self> {
        let root = root.into();
        let config = Arc::new(YamlDocument::open(root.join(PROJECT_CONFIG_FILE)).await);
        let timeline = Timeline::new(&root, Arc::clone(&config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            timeline,
            config,
            registry,
            deps: ToolDeps {
                model: deps.model,
                frames: deps.frames,
                reconciler: Arc::new(ResultReconciler::new(deps.resources)),
            },
            wired: Mutex::new(HashSet::new()),
            events,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Arc<YamlDocument> {
        &self.config
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Current item, 1 when unset.
    pub async fn timeline_index(&self) -> usize {
        self.config
            .get_u64(TIMELINE_INDEX_KEY)
            .await
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n >= 1)
            .unwrap_or(1)
    }

    pub async fn set_timeline_index(&self, index: usize) -> Result<(), StoreError> {
        self.config.set(TIMELINE_INDEX_KEY, index as u64).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.events.subscribe()
    }

    /// Open item `index` with tools attached and events forwarded.
    pub async fn item(&self, index: usize) -> Result<Arc<TimelineItem>, ToolError> {
        let item = self
            .timeline
            .get_item(index)
            .await
            .ok_or(ToolError::ItemUnavailable(index))?;

        let mut wired = self.wired.lock().await;
        if wired.insert(index) {
            self.registry.attach(&item, &self.deps);
            self.forward_events(&item);
            item.tasks().load_all_tasks().await;
        }
        Ok(item)
    }

    /// Append a new item to the timeline.
    pub async fn add_item(&self) -> Result<Arc<TimelineItem>, ToolError> {
        let index = self.timeline.size().await + 1;
        self.item(index).await
    }

    fn forward_events(&self, item: &TimelineItem) {
        let mut rx = item.tasks().subscribe();
        let tx = self.events.clone();
        let index = item.index();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(ProjectEvent { item: index, event });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(item = index, skipped = n, "Task event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(item = index, "Task event forwarder done");
        });
    }

    /// Open the current item and load its tasks.
    pub async fn start(&self) -> Result<(), Error> {
        let index = self.timeline_index().await;
        let item = self.item(index).await?;
        item.tasks().start().await;
        info!(root = %self.root.display(), item = index, "Project started");
        Ok(())
    }

    /// Route `options` to an item's task manager.
    ///
    /// `timeline_index` in `options` picks the item; the current index is
    /// stamped in when it is missing.
    pub async fn submit_task(&self, options: TaskOptions) -> Result<Arc<TimelineItem>, Error> {
        let mut options = options;
        let index = match options.timeline_index() {
            Some(index) => index,
            None => {
                let index = self.timeline_index().await;
                options.set(TIMELINE_INDEX_KEY, index as u64);
                index
            }
        };
        let item = self.item(index).await?;
        if options.input_image_path().is_none() {
            options.set(
                "input_image_path",
                item.image_path().to_string_lossy().into_owned(),
            );
        }
        debug!(item = index, tool = %options.tool(), "Submitting task");
        item.tasks().submit_task(options);
        Ok(item)
    }

    /// Wait until every opened item has drained its queues.
    pub async fn join(&self) {
        for item in self.timeline.opened_items().await {
            item.tasks().join().await;
        }
    }

    /// Stop every opened item's queues.
    ///
    /// Event subscribers see `Closed` once the project itself is dropped.
    pub async fn stop(&self) {
        for item in self.timeline.opened_items().await {
            item.tasks().stop();
        }
    }
}
