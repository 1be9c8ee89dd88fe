//! Generation model backed by a ComfyUI server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::comfy::client::{ComfyUiClient, WorkflowOutcome};
use crate::comfy::workflow::{IMAGE_EDIT, IMAGE2VIDEO, TEXT2IMAGE, Workflow};
use crate::config::PipelineConfig;
use crate::progress::Progress;
use crate::store::MediaType;

/// Outcome of one generation call. At most one media path is set.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResult {
    Image(PathBuf),
    Video(PathBuf),
    Failed(String),
}

impl ModelResult {
    pub fn image_path(&self) -> Option<&Path> {
        match self {
            Self::Image(p) => Some(p),
            _ => None,
        }
    }

    pub fn video_path(&self) -> Option<&Path> {
        match self {
            Self::Video(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Classify the first downloaded file by extension.
    pub fn from_outcome(outcome: WorkflowOutcome) -> Self {
        match outcome {
            WorkflowOutcome::Error { error } => Self::Failed(error),
            WorkflowOutcome::Success { output_files, .. } => {
                let Some(first) = output_files.into_iter().next() else {
                    return Self::Failed("workflow produced no output files".to_string());
                };
                match MediaType::from_path(&first) {
                    MediaType::Image => Self::Image(first),
                    MediaType::Video => Self::Video(first),
                    _ => Self::Failed(format!("unexpected output {}", first.display())),
                }
            }
        }
    }
}

/// A backend able to run the three generation kinds.
#[async_trait]
pub trait GenerationModel: Send + Sync {
    async fn text2image(&self, prompt: &str, save_dir: &Path, progress: &Progress) -> ModelResult;

    async fn image_edit(
        &self,
        input: &Path,
        prompt: &str,
        save_dir: &Path,
        progress: &Progress,
    ) -> ModelResult;

    async fn image2video(
        &self,
        input: &Path,
        prompt: &str,
        save_dir: &Path,
        progress: &Progress,
    ) -> ModelResult;
}

/// `model = "comfy_ui"`. Every call uses a fresh client.
pub struct ComfyUiModel {
    config: PipelineConfig,
}

impl ComfyUiModel {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    async fn run(
        &self,
        template: &str,
        prompt: &str,
        input: Option<&Path>,
        save_dir: &Path,
        progress: &Progress,
        timeout: Duration,
    ) -> ModelResult {
        let mut workflow = match Workflow::load(&self.config.workflows_dir, template).await {
            Ok(w) => w,
            Err(e) => {
                warn!(template, error = %e, "Cannot load workflow template");
                return ModelResult::Failed(format!("cannot load workflow {template}: {e}"));
            }
        };

        let mut client = ComfyUiClient::new(self.config.comfyui.clone());
        let remote_image = match input {
            Some(path) => match client.upload_image(path).await {
                Some(uploaded) => Some(uploaded.remote_name()),
                None => return ModelResult::Failed("failed to upload image".to_string()),
            },
            None => None,
        };

        workflow.substitute(prompt, remote_image.as_deref(), rand::random::<u32>());
        let outcome = client
            .run_workflow(&workflow, &workflow.output_nodes, progress, save_dir, timeout)
            .await;
        if let WorkflowOutcome::Error { error } = &outcome {
            warn!(template, error = %error, "Workflow failed");
        } else {
            info!(template, files = outcome.output_files().len(), "Workflow succeeded");
        }
        ModelResult::from_outcome(outcome)
    }
}

#[async_trait]
impl GenerationModel for ComfyUiModel {
    async fn text2image(&self, prompt: &str, save_dir: &Path, progress: &Progress) -> ModelResult {
        self.run(TEXT2IMAGE, prompt, None, save_dir, progress, self.config.image_timeout)
            .await
    }

    async fn image_edit(
        &self,
        input: &Path,
        prompt: &str,
        save_dir: &Path,
        progress: &Progress,
    ) -> ModelResult {
        self.run(
            IMAGE_EDIT,
            prompt,
            Some(input),
            save_dir,
            progress,
            self.config.image_timeout,
        )
        .await
    }

    async fn image2video(
        &self,
        input: &Path,
        prompt: &str,
        save_dir: &Path,
        progress: &Progress,
    ) -> ModelResult {
        self.run(
            IMAGE2VIDEO,
            prompt,
            Some(input),
            save_dir,
            progress,
            self.config.video_timeout,
        )
        .await
    }
}
