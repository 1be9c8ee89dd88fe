//! ComfyUI wire protocol client.
//!
//! One client submits one workflow: `POST /prompt`, then listens on
//! `/ws?clientId=<id>` for execution events while re-polling
//! `/history/<prompt_id>` until the job shows up as finished, then downloads
//! the outputs through `/view`. Nothing here returns an error across the
//! public boundary; failures come back as `None` or `WorkflowOutcome::Error`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::comfy::events::ExecutionEvent;
use crate::comfy::workflow::Workflow;
use crate::config::ComfyUiConfig;
use crate::error::ClientError;
use crate::progress::Progress;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Fixed output name for image artifacts. Several images on one node overwrite each other.
pub const IMAGE_OUTPUT: &str = "output.png";
/// Fixed output name for animated/video artifacts.
pub const VIDEO_OUTPUT: &str = "output.mp4";

/// Result of `run_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Success {
        prompt_id: String,
        output_files: Vec<PathBuf>,
        filenames: Vec<String>,
    },
    Error {
        error: String,
    },
}

impl WorkflowOutcome {
    fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Downloaded files, empty on error.
    pub fn output_files(&self) -> &[PathBuf] {
        match self {
            Self::Success { output_files, .. } => output_files,
            Self::Error { .. } => &[],
        }
    }
}

/// Server response to `/upload/image`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadedImage {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl UploadedImage {
    /// Name to reference from a `LoadImage` node.
    pub fn remote_name(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

enum Step {
    Text(String),
    /// A non-text frame or an idle frame-wait.
    Poll,
    Pong,
    PingDue,
    Disconnected(String),
}

pub struct ComfyUiClient {
    config: ComfyUiConfig,
    client_id: Uuid,
    http: reqwest::Client,
    ws: Option<WsStream>,
}

impl ComfyUiClient {
    pub fn new(config: ComfyUiConfig) -> Self {
        Self {
            config,
            client_id: Uuid::new_v4(),
            http: reqwest::Client::new(),
            ws: None,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn ws_url(&self) -> String {
        let base = &self.config.base_url;
        let host = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.clone()
        };
        format!("{host}/ws?clientId={}", self.client_id)
    }

    /// Open (or reopen) the event WebSocket.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if let Some(mut old) = self.ws.take() {
            let _ = old.close(None).await;
        }
        let url = self.ws_url();
        let (ws, _) = connect_async(url.as_str()).await?;
        debug!(url = %url, "WebSocket connected");
        self.ws = Some(ws);
        Ok(())
    }

    /// `connect`, giving up after `limit`.
    async fn connect_within(&mut self, limit: Duration) -> Result<(), ClientError> {
        match tokio::time::timeout(limit, self.connect()).await {
            Ok(result) => result,
            Err(_) => {
                self.ws = None;
                Err(ClientError::Timeout(limit))
            }
        }
    }

    /// Close the WebSocket. Safe to call when not connected.
    pub async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close(None).await {
                debug!(error = %e, "WebSocket close failed");
            }
        }
    }

    /// Submit a workflow. Returns the server-assigned prompt id.
    pub async fn send_prompt(&self, workflow: &Workflow) -> Option<String> {
        let body = json!({
            "prompt": workflow.graph,
            "client_id": self.client_id.to_string(),
        });
        let resp = match self
            .http
            .post(self.url("/prompt"))
            .timeout(self.config.frame_timeout)
            .json(&body)
            .send()
            .await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Prompt submission failed");
                return None;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "Prompt rejected");
            return None;
        }

        match resp.json::<Value>().await {
            Ok(v) => {
                let id = match v.get("prompt_id") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                if id.is_none() {
                    warn!(response = %v, "Prompt response has no prompt_id");
                }
                id
            }
            Err(e) => {
                warn!(error = %e, "Prompt response is not JSON");
                None
            }
        }
    }

    /// History entry for a finished prompt; `None` while still running.
    ///
    /// Accepts both `{<prompt_id>: {...}}` and the bare entry.
    pub async fn get_history(&self, prompt_id: &str) -> Option<Value> {
        let resp = match self
            .http
            .get(self.url(&format!("/history/{prompt_id}")))
            .timeout(self.config.frame_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "History poll rejected");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "History poll failed");
                return None;
            }
        };

        let mut body: Value = resp.json().await.ok()?;
        let entry = match body.as_object_mut().and_then(|m| m.remove(prompt_id)) {
            Some(entry) => entry,
            None => body,
        };
        match entry.as_object() {
            Some(map) if !map.is_empty() => Some(entry),
            _ => None,
        }
    }

    /// Wait for `prompt_id` to finish, feeding events into `progress`.
    ///
    /// Returns the history entry, or `None` on timeout, when the single
    /// reconnect after a dropped socket fails, or when the socket drops a
    /// second time. Never blocks much past `timeout`: each frame-wait and the
    /// reconnect handshake are capped by the time left.
    pub async fn listen_execution(
        &mut self,
        prompt_id: &str,
        timeout: Duration,
        progress: &Progress,
    ) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let ping_interval = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;
        let mut reconnected = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let frame_wait = self.config.frame_timeout.min(deadline - now);

            let step = match self.ws.as_mut() {
                None => Step::Disconnected("not connected".to_string()),
                Some(ws) => {
                    let overdue_at = pong_deadline.unwrap_or(deadline);
                    tokio::select! {
                        frame = tokio::time::timeout(frame_wait, ws.next()) => match frame {
                            Err(_) => Step::Poll,
                            Ok(Some(Ok(Message::Text(text)))) => Step::Text(text.as_str().to_owned()),
                            Ok(Some(Ok(Message::Pong(_)))) => Step::Pong,
                            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                                Step::Disconnected("closed by server".to_string())
                            }
                            Ok(Some(Ok(_))) => Step::Poll,
                            Ok(Some(Err(e))) => Step::Disconnected(e.to_string()),
                        },
                        _ = ping.tick() => Step::PingDue,
                        _ = tokio::time::sleep_until(overdue_at), if pong_deadline.is_some() => {
                            Step::Disconnected("keep-alive ping timed out".to_string())
                        }
                    }
                }
            };

            match step {
                Step::Text(text) => match ExecutionEvent::parse(&text) {
                    Some(event) => event.apply(progress).await,
                    None => debug!(frame = %text, "Ignoring non-event frame"),
                },
                Step::Poll => {}
                Step::Pong => pong_deadline = None,
                Step::PingDue => {
                    if pong_deadline.is_none() {
                        if let Some(ws) = self.ws.as_mut() {
                            if let Err(e) = ws.send(Message::Ping(Default::default())).await {
                                debug!(error = %e, "Ping failed");
                            }
                        }
                        pong_deadline = Some(Instant::now() + self.config.ping_timeout);
                    }
                    continue;
                }
                Step::Disconnected(reason) => {
                    if reconnected {
                        warn!(prompt_id, reason = %reason, "WebSocket dropped again, giving up");
                        self.ws = None;
                        return None;
                    }
                    reconnected = true;
                    if !self.reconnect(prompt_id, &reason, deadline).await {
                        return None;
                    }
                    pong_deadline = None;
                    ping.reset();
                }
            }

            if let Some(history) = self.get_history(prompt_id).await {
                progress.on_progress(100, "Execution finished").await;
                return Some(history);
            }
        }

        warn!(prompt_id, ?timeout, "Timed out waiting for execution");
        None
    }

    async fn reconnect(&mut self, prompt_id: &str, reason: &str, deadline: Instant) -> bool {
        warn!(prompt_id, reason, "WebSocket dropped, reconnecting");
        self.ws = None;
        let left = deadline.saturating_duration_since(Instant::now());
        match self.connect_within(left).await {
            Ok(()) => {
                info!(prompt_id, "WebSocket reconnected");
                true
            }
            Err(e) => {
                warn!(prompt_id, error = %e, "Reconnect failed, giving up");
                false
            }
        }
    }

    /// Download one artifact to `save_path`.
    pub async fn download(&self, filename: &str, subfolder: &str, save_path: &Path) -> bool {
        let resp = self
            .http
            .get(self.url("/view"))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", "output")])
            .send()
            .await;
        let bytes = match resp {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(filename, error = %e, "Download body failed");
                    return false;
                }
            },
            Ok(resp) => {
                warn!(filename, status = resp.status().as_u16(), "Download rejected");
                return false;
            }
            Err(e) => {
                warn!(filename, error = %e, "Download failed");
                return false;
            }
        };

        if let Some(parent) = save_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "Cannot create output dir");
                return false;
            }
        }
        match tokio::fs::write(save_path, &bytes).await {
            Ok(()) => {
                debug!(path = %save_path.display(), "Downloaded");
                true
            }
            Err(e) => {
                warn!(path = %save_path.display(), error = %e, "Cannot write output");
                false
            }
        }
    }

    /// Upload a local image. `None` if the file is missing or the server refuses it.
    pub async fn upload_image(&self, path: &Path) -> Option<UploadedImage> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read upload source");
                return None;
            }
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.png")
            .to_string();
        let form = Form::new().part("image", Part::bytes(bytes).file_name(file_name));

        match self
            .http
            .post(self.url("/upload/image"))
            .timeout(self.config.frame_timeout)
            .multipart(form)
            .send()
            .await {
            Ok(resp) if resp.status().is_success() => match resp.json::<UploadedImage>().await {
                Ok(uploaded) => {
                    info!(path = %path.display(), name = %uploaded.name, "Image uploaded");
                    Some(uploaded)
                }
                Err(e) => {
                    warn!(error = %e, "Upload response has no name");
                    None
                }
            },
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                warn!(status, body = %text, "Upload rejected");
                None
            }
            Err(e) => {
                warn!(error = %e, "Upload failed");
                None
            }
        }
    }

    /// Connect, submit, wait and download. Always closes the socket.
    ///
    /// The initial handshake counts against `timeout`.
    pub async fn run_workflow(
        &mut self,
        workflow: &Workflow,
        output_nodes: &[String],
        progress: &Progress,
        save_dir: &Path,
        timeout: Duration,
    ) -> WorkflowOutcome {
        let started = Instant::now();
        let outcome = match self.connect_within(timeout).await {
            Ok(()) => {
                let left = timeout.saturating_sub(started.elapsed());
                self.submit_and_collect(workflow, output_nodes, progress, save_dir, left)
                    .await
            }
            Err(e) => WorkflowOutcome::error(format!("connect failed: {e}")),
        };
        self.close().await;
        outcome
    }

    async fn submit_and_collect(
        &mut self,
        workflow: &Workflow,
        output_nodes: &[String],
        progress: &Progress,
        save_dir: &Path,
        timeout: Duration,
    ) -> WorkflowOutcome {
        let Some(prompt_id) = self.send_prompt(workflow).await else {
            return WorkflowOutcome::error("failed to submit workflow");
        };
        info!(prompt_id = %prompt_id, nodes = workflow.node_count(), "Workflow submitted");

        progress
            .set_total(u32::try_from(workflow.node_count()).unwrap_or(u32::MAX))
            .await;
        let Some(history) = self.listen_execution(&prompt_id, timeout, progress).await else {
            return WorkflowOutcome::error("timeout");
        };

        let mut output_files = Vec::new();
        let mut filenames = Vec::new();
        let outputs = history.get("outputs").cloned().unwrap_or_default();
        for node_id in output_nodes {
            let Some(node) = outputs.get(node_id) else {
                continue;
            };
            for (key, target) in [("images", IMAGE_OUTPUT), ("gifs", VIDEO_OUTPUT)] {
                let Some(items) = node.get(key).and_then(Value::as_array) else {
                    continue;
                };
                for item in items {
                    let Some(filename) = item.get("filename").and_then(Value::as_str) else {
                        continue;
                    };
                    let subfolder = item.get("subfolder").and_then(Value::as_str).unwrap_or("");
                    filenames.push(filename.to_string());
                    let save_path = save_dir.join(target);
                    if self.download(filename, subfolder, &save_path).await
                        && !output_files.contains(&save_path)
                    {
                        output_files.push(save_path);
                    }
                }
            }
        }

        info!(prompt_id = %prompt_id, files = output_files.len(), "Workflow finished");
        WorkflowOutcome::Success {
            prompt_id,
            output_files,
            filenames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ComfyUiClient {
        ComfyUiClient::new(ComfyUiConfig {
            base_url: base.to_string(),
            ..ComfyUiConfig::default()
        })
    }

    #[test]
    fn ws_url_follows_scheme() {
        let c = client("http://127.0.0.1:8188");
        assert_eq!(
            c.ws_url(),
            format!("ws://127.0.0.1:8188/ws?clientId={}", c.client_id())
        );
        let c = client("https://comfy.example.com");
        assert!(c.ws_url().starts_with("wss://comfy.example.com/ws?clientId="));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let ok = WorkflowOutcome::Success {
            prompt_id: "p1".into(),
            output_files: vec![PathBuf::from("out/output.png")],
            filenames: vec!["ComfyUI_0001.png".into()],
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["output_files"][0], "out/output.png");

        let err = serde_json::to_value(WorkflowOutcome::error("timeout")).unwrap();
        assert_eq!(err, json!({"status": "error", "error": "timeout"}));
    }

    #[test]
    fn remote_name_includes_subfolder() {
        let img = UploadedImage {
            name: "a.png".into(),
            subfolder: "inputs".into(),
            kind: "input".into(),
        };
        assert_eq!(img.remote_name(), "inputs/a.png");
    }

    #[tokio::test]
    async fn upload_missing_file_returns_none() {
        let c = client("http://127.0.0.1:9");
        assert!(c.upload_image(Path::new("/definitely/not/here.png")).await.is_none());
    }

    #[tokio::test]
    async fn silent_handshake_is_cut_off() {
        // Accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut c = client(&format!("http://127.0.0.1:{port}"));

        let started = Instant::now();
        let err = c.connect_within(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!c.is_connected());

        let wf = Workflow::from_value(json!({"1": {"class_type": "SaveImage"}})).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let started = Instant::now();
        let outcome = c
            .run_workflow(&wf, &wf.output_nodes, &Progress::new(), dir.path(), Duration::from_millis(300))
            .await;
        assert!(!outcome.is_success());
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error_outcome() {
        let mut c = client("http://127.0.0.1:9");
        let wf = Workflow::from_value(json!({"1": {"class_type": "SaveImage"}})).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = c
            .run_workflow(&wf, &wf.output_nodes, &Progress::new(), dir.path(), Duration::from_secs(1))
            .await;
        assert!(!outcome.is_success());
        assert!(!c.is_connected());
    }
}
