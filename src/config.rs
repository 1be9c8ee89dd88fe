//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Backend connection settings used by `ComfyUiClient`.
#[derive(Debug, Clone)]
pub struct ComfyUiConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:8188`.
    pub base_url: String,
    /// How long to wait for a single WebSocket frame before re-polling history.
    pub frame_timeout: Duration,
    /// Keep-alive ping interval.
    pub ping_interval: Duration,
    /// How long a ping may go unanswered before the socket is considered dead.
    pub ping_timeout: Duration,
}

impl Default for ComfyUiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            frame_timeout: Duration::from_secs(100),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub comfyui: ComfyUiConfig,
    /// Directory holding `<name>.json` workflow templates.
    pub workflows_dir: PathBuf,
    /// Wall-clock timeout for image jobs (text2img, imgedit).
    pub image_timeout: Duration,
    /// Wall-clock timeout for video jobs (img2video).
    pub video_timeout: Duration,
    /// ffmpeg binary used to grab the last frame of a video.
    pub ffmpeg_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            comfyui: ComfyUiConfig::default(),
            workflows_dir: PathBuf::from("./workflows"),
            image_timeout: Duration::from_secs(120),
            video_timeout: Duration::from_secs(3200),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `FILMETO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let base_url = lookup("FILMETO_COMFYUI_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.comfyui.base_url);
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "FILMETO_COMFYUI_URL".to_string(),
                message: format!("expected an http(s) URL, got {base_url:?}"),
            });
        }

        let secs = |key: &str, default: Duration| -> Duration {
            match lookup(key) {
                None => default,
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(v) if v > 0 => Duration::from_secs(v),
                    _ => {
                        tracing::warn!(key, value = %raw, "Invalid duration, using default");
                        default
                    }
                },
            }
        };

        Ok(Self {
            comfyui: ComfyUiConfig {
                base_url,
                frame_timeout: secs("FILMETO_FRAME_TIMEOUT_SECS", defaults.comfyui.frame_timeout),
                ping_interval: secs("FILMETO_PING_INTERVAL_SECS", defaults.comfyui.ping_interval),
                ping_timeout: secs("FILMETO_PING_TIMEOUT_SECS", defaults.comfyui.ping_timeout),
            },
            workflows_dir: lookup("FILMETO_WORKFLOWS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflows_dir),
            image_timeout: secs("FILMETO_IMAGE_TIMEOUT_SECS", defaults.image_timeout),
            video_timeout: secs("FILMETO_VIDEO_TIMEOUT_SECS", defaults.video_timeout),
            ffmpeg_path: lookup("FILMETO_FFMPEG").unwrap_or(defaults.ffmpeg_path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.comfyui.base_url, "http://127.0.0.1:8188");
        assert_eq!(cfg.image_timeout, Duration::from_secs(120));
        assert_eq!(cfg.video_timeout, Duration::from_secs(3200));
        assert_eq!(cfg.comfyui.frame_timeout, Duration::from_secs(100));
    }

    #[test]
    fn overrides_and_trailing_slash() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("FILMETO_COMFYUI_URL", "http://10.0.0.2:3000/"),
            ("FILMETO_VIDEO_TIMEOUT_SECS", "60"),
            ("FILMETO_WORKFLOWS_DIR", "/srv/workflows"),
        ]))
        .unwrap();
        assert_eq!(cfg.comfyui.base_url, "http://10.0.0.2:3000");
        assert_eq!(cfg.video_timeout, Duration::from_secs(60));
        assert_eq!(cfg.workflows_dir, PathBuf::from("/srv/workflows"));
    }

    #[test]
    fn bad_number_falls_back() {
        let cfg =
            PipelineConfig::from_lookup(lookup(&[("FILMETO_IMAGE_TIMEOUT_SECS", "soon")])).unwrap();
        assert_eq!(cfg.image_timeout, Duration::from_secs(120));
    }

    #[test]
    fn rejects_schemeless_url() {
        let err = PipelineConfig::from_lookup(lookup(&[("FILMETO_COMFYUI_URL", "10.0.0.2:3000")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }
}
