//! Tool trait and the context a tool runs with.

use std::sync::Arc;

use async_trait::async_trait;

use crate::comfy::{GenerationModel, ModelResult};
use crate::error::ToolError;
use crate::progress::Progress;
use crate::project::timeline::{ItemPaths, TimelineItem};
use crate::task::Task;
use crate::tools::frames::FrameExtractor;

/// Everything a tool may touch while running one task.
pub struct ToolContext {
    pub model: Arc<dyn GenerationModel>,
    pub frames: Arc<dyn FrameExtractor>,
    /// Item that owns the task.
    pub item: Arc<TimelineItem>,
    /// The item before it on the timeline, if any.
    pub previous: Option<ItemPaths>,
}

/// One generation capability, selected by the task's `tool` option.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Other `tool` values this tool answers to.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn matches(&self, tool: &str) -> bool {
        tool == self.name() || self.aliases().contains(&tool)
    }

    async fn run(
        &self,
        task: &Arc<Task>,
        ctx: &ToolContext,
        progress: &Progress,
    ) -> Result<ModelResult, ToolError>;
}
