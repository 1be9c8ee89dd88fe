//! Last-frame extraction for chaining a video into the next item.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

/// Longest stderr excerpt carried in an error.
const MAX_STDERR: usize = 512;

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Write the last frame of `video` to `output`.
    async fn extract_last_frame(&self, video: &Path, output: &Path) -> Result<(), ToolError>;
}

/// Shells out to `ffmpeg -y -sseof -1 -i <video> -update 1 -frames:v 1 <output>`.
pub struct FfmpegFrameExtractor {
    binary: String,
}

impl FfmpegFrameExtractor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegFrameExtractor {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract_last_frame(&self, video: &Path, output: &Path) -> Result<(), ToolError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = Command::new(&self.binary)
            .args(["-y", "-sseof", "-1", "-i"])
            .arg(video)
            .args(["-update", "1", "-frames:v", "1"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::FrameExtraction(format!("cannot run {}: {e}", self.binary)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let start = stderr.len().saturating_sub(MAX_STDERR);
            let tail = stderr.get(start..).unwrap_or(&stderr).trim();
            return Err(ToolError::FrameExtraction(format!(
                "{} exited with {}: {tail}",
                self.binary, result.status
            )));
        }
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(ToolError::FrameExtraction("no frame written".to_string()));
        }

        debug!(video = %video.display(), frame = %output.display(), "Extracted last frame");
        Ok(())
    }
}
