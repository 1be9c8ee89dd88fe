//! Static tool registry and execute-channel dispatch.

use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};

use crate::comfy::{GenerationModel, ModelResult};
use crate::project::reconcile::ResultReconciler;
use crate::project::timeline::TimelineItem;
use crate::task::{Task, TaskResult, TaskStatus};
use crate::tools::frames::FrameExtractor;
use crate::tools::imgedit::ImgEdit;
use crate::tools::img2video::Img2Video;
use crate::tools::text2img::Text2Img;
use crate::tools::tool::{Tool, ToolContext};

/// Shared collaborators handed to every dispatched tool.
#[derive(Clone)]
pub struct ToolDeps {
    pub model: Arc<dyn GenerationModel>,
    pub frames: Arc<dyn FrameExtractor>,
    pub reconciler: Arc<ResultReconciler>,
}

/// The set of tools known at compile time.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// text2img, imgedit and img2video.
    pub fn builtin() -> Self {
        Self::new(vec![Arc::new(Text2Img), Arc::new(ImgEdit), Arc::new(Img2Video)])
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, tool: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.matches(tool)).cloned()
    }

    /// Connect one execute handler per tool to `item`'s task manager.
    ///
    /// Each handler ignores tasks whose `tool` it does not answer to, so all
    /// of them can share the channel.
    pub fn attach(&self, item: &Arc<TimelineItem>, deps: &ToolDeps) {
        for tool in &self.tools {
            let tool = Arc::clone(tool);
            let weak_item: Weak<TimelineItem> = Arc::downgrade(item);
            let deps = deps.clone();
            item.tasks().connect_execute(move |task: Arc<Task>| {
                let tool = Arc::clone(&tool);
                let weak_item = weak_item.clone();
                let deps = deps.clone();
                async move {
                    let requested = task.tool().await;
                    if !tool.matches(&requested) {
                        return Ok(());
                    }
                    let Some(item) = weak_item.upgrade() else {
                        debug!(task_id = %task.id(), "Timeline item dropped, skipping task");
                        return Ok(());
                    };
                    dispatch(tool.as_ref(), task, item, &deps).await;
                    Ok(())
                }
            });
        }
        debug!(item = item.index(), tools = self.tools.len(), "Tools attached");
    }
}

/// Run `tool` on `task`, then reconcile and notify. Failures end up as a
/// failed result; nothing is retried.
async fn dispatch(tool: &dyn Tool, task: Arc<Task>, item: Arc<TimelineItem>, deps: &ToolDeps) {
    info!(item = item.index(), task_id = %task.id(), tool = tool.name(), "Running task");

    let result = match task.transition(TaskStatus::Running).await {
        Err(e) => ModelResult::Failed(e.to_string()),
        Ok(()) => {
            let ctx = ToolContext {
                model: Arc::clone(&deps.model),
                frames: Arc::clone(&deps.frames),
                item: Arc::clone(&item),
                previous: item.previous(),
            };
            let progress = item.tasks().progress_for(&task);
            match tool.run(&task, &ctx, &progress).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(task_id = %task.id(), tool = tool.name(), error = %e, "Tool failed");
                    ModelResult::Failed(e.to_string())
                }
            }
        }
    };

    let task_result = TaskResult::new(task, result);
    if let Err(e) = deps.reconciler.reconcile(&item, &task_result).await {
        error!(task_id = %task_result.task.id(), error = %e, "Failed to reconcile task result");
    }
    item.tasks().notify_finished(task_result);
}
