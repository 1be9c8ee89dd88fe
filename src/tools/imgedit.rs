use std::sync::Arc;

use async_trait::async_trait;

use crate::comfy::ModelResult;
use crate::error::ToolError;
use crate::progress::Progress;
use crate::task::Task;
use crate::tools::tool::{Tool, ToolContext};

/// Edit an existing image with a prompt. Needs `input_image_path`.
pub struct ImgEdit;

#[async_trait]
impl Tool for ImgEdit {
    fn name(&self) -> &'static str {
        "imgedit"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["image_edit"]
    }

    async fn run(
        &self,
        task: &Arc<Task>,
        ctx: &ToolContext,
        progress: &Progress,
    ) -> Result<ModelResult, ToolError> {
        let options = task.options().await;
        let input = options
            .input_image_path()
            .ok_or(ToolError::MissingOption("input_image_path"))?;
        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return Err(ToolError::InputNotFound(input));
        }
        Ok(ctx
            .model
            .image_edit(&input, options.prompt(), task.path(), progress)
            .await)
    }
}
