//! Image to video, with input fallback from the previous timeline item.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::comfy::ModelResult;
use crate::error::ToolError;
use crate::progress::Progress;
use crate::task::{Task, TaskOptions};
use crate::tools::tool::{Tool, ToolContext};

pub struct Img2Video;

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Pick the input image for an img2video task.
///
/// 1. The current item already has content: use the task's input path.
/// 2. Otherwise, the previous item has a video: its last frame becomes this
///    item's `image.png`.
/// 3. Otherwise, the previous item has an image: copy it into this item.
///
/// Whatever path is chosen must exist.
pub async fn resolve_input(options: &TaskOptions, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
    let target = ctx.item.image_path();
    let mut input = options.input_image_path().unwrap_or_else(|| target.clone());

    if ctx.item.has_content().await {
        debug!(item = ctx.item.index(), "Item has content, using task input");
    } else if let Some(prev) = &ctx.previous {
        let prev_video = prev.video_path();
        let prev_image = prev.image_path();
        if exists(&prev_video).await {
            info!(video = %prev_video.display(), "Taking last frame of previous item");
            match ctx.frames.extract_last_frame(&prev_video, &target).await {
                Ok(()) => input = target,
                Err(e) => warn!(error = %e, "Last-frame extraction failed"),
            }
        } else if exists(&prev_image).await {
            info!(image = %prev_image.display(), "Copying image from previous item");
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&prev_image, &target).await?;
            input = target;
        } else {
            debug!(item = prev.index(), "Previous item has no media");
        }
    } else {
        debug!(item = ctx.item.index(), "No previous item");
    }

    if !exists(&input).await {
        return Err(ToolError::InputNotFound(input));
    }
    Ok(input)
}

#[async_trait]
impl Tool for Img2Video {
    fn name(&self) -> &'static str {
        "img2video"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["image2video"]
    }

    async fn run(
        &self,
        task: &Arc<Task>,
        ctx: &ToolContext,
        progress: &Progress,
    ) -> Result<ModelResult, ToolError> {
        let options = task.options().await;
        let input = resolve_input(&options, ctx).await?;
        info!(task_id = %task.id(), input = %input.display(), "Using input image");
        Ok(ctx
            .model
            .image2video(&input, options.prompt(), task.path(), progress)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comfy::GenerationModel;
    use crate::project::timeline::TimelineItem;
    use crate::tools::frames::FrameExtractor;
    use tempfile::TempDir;

    struct UnusedModel;

    #[async_trait]
    impl GenerationModel for UnusedModel {
        async fn text2image(&self, _: &str, _: &Path, _: &Progress) -> ModelResult {
            ModelResult::Failed("unused".into())
        }
        async fn image_edit(&self, _: &Path, _: &str, _: &Path, _: &Progress) -> ModelResult {
            ModelResult::Failed("unused".into())
        }
        async fn image2video(&self, _: &Path, _: &str, _: &Path, _: &Progress) -> ModelResult {
            ModelResult::Failed("unused".into())
        }
    }

    /// Writes a marker instead of decoding video.
    struct FakeFrames;

    #[async_trait]
    impl FrameExtractor for FakeFrames {
        async fn extract_last_frame(&self, _video: &Path, output: &Path) -> Result<(), ToolError> {
            tokio::fs::write(output, b"last-frame").await?;
            Ok(())
        }
    }

    async fn context(dir: &TempDir, index: usize) -> ToolContext {
        let timeline = dir.path().join("timeline");
        let item = TimelineItem::open(&timeline, index).await.unwrap();
        let previous = item.previous();
        ToolContext {
            model: Arc::new(UnusedModel),
            frames: Arc::new(FakeFrames),
            item,
            previous,
        }
    }

    #[tokio::test]
    async fn previous_video_supplies_last_frame() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 2).await;
        let prev = ctx.previous.clone().unwrap();
        tokio::fs::create_dir_all(prev.dir()).await.unwrap();
        tokio::fs::write(prev.video_path(), b"mp4").await.unwrap();
        tokio::fs::write(prev.image_path(), b"png").await.unwrap();

        let input = resolve_input(&TaskOptions::new(), &ctx).await.unwrap();
        assert_eq!(input, ctx.item.image_path());
        assert_eq!(tokio::fs::read(&input).await.unwrap(), b"last-frame");
    }

    #[tokio::test]
    async fn previous_image_is_copied_forward() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 2).await;
        let prev = ctx.previous.clone().unwrap();
        tokio::fs::create_dir_all(prev.dir()).await.unwrap();
        tokio::fs::write(prev.image_path(), b"png").await.unwrap();

        let input = resolve_input(&TaskOptions::new(), &ctx).await.unwrap();
        assert_eq!(input, ctx.item.image_path());
        assert_eq!(tokio::fs::read(&input).await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn current_content_wins() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 2).await;
        let own = dir.path().join("own.png");
        tokio::fs::write(&own, b"mine").await.unwrap();
        tokio::fs::write(ctx.item.image_path(), b"drawn").await.unwrap();
        let prev = ctx.previous.clone().unwrap();
        tokio::fs::create_dir_all(prev.dir()).await.unwrap();
        tokio::fs::write(prev.video_path(), b"mp4").await.unwrap();

        let options = TaskOptions::new().with("input_image_path", own.to_string_lossy().into_owned());
        assert_eq!(resolve_input(&options, &ctx).await.unwrap(), own);
    }

    #[tokio::test]
    async fn nothing_to_use_is_input_not_found() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 1).await;
        assert!(ctx.previous.is_none());
        let err = resolve_input(&TaskOptions::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InputNotFound(_)));
    }

    #[test]
    fn answers_to_alias() {
        assert!(Img2Video.matches("img2video"));
        assert!(Img2Video.matches("image2video"));
        assert!(!Img2Video.matches("text2img"));
    }
}
