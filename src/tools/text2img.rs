use std::sync::Arc;

use async_trait::async_trait;

use crate::comfy::ModelResult;
use crate::error::ToolError;
use crate::progress::Progress;
use crate::task::Task;
use crate::tools::tool::{Tool, ToolContext};

/// Prompt to image.
pub struct Text2Img;

#[async_trait]
impl Tool for Text2Img {
    fn name(&self) -> &'static str {
        "text2img"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["text2image", "txt2img"]
    }

    async fn run(
        &self,
        task: &Arc<Task>,
        ctx: &ToolContext,
        progress: &Progress,
    ) -> Result<ModelResult, ToolError> {
        let options = task.options().await;
        Ok(ctx
            .model
            .text2image(options.prompt(), task.path(), progress)
            .await)
    }
}
