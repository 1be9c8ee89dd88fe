//! Execution events pushed over the backend WebSocket.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::progress::Progress;

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// A decoded event frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    ExecutionStart,
    /// Per-node sampling progress.
    Progress { node: String, value: u64, max: u64 },
    Executing { node: Option<String> },
    Executed { node: Option<String> },
    /// Any other frame type (`status`, `execution_cached`, ...).
    Other { kind: String },
}

fn node_id(data: &Value) -> Option<String> {
    match data.get("node") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl ExecutionEvent {
    /// Decode a text frame. Returns `None` for frames that are not JSON events.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: RawFrame = serde_json::from_str(text).ok()?;
        let data = &frame.data;
        Some(match frame.kind.as_str() {
            "execution_start" => Self::ExecutionStart,
            "progress" => Self::Progress {
                node: node_id(data).unwrap_or_else(|| "unknown".to_string()),
                value: data.get("value").and_then(Value::as_u64).unwrap_or(0),
                max: data.get("max").and_then(Value::as_u64).unwrap_or(1),
            },
            "executing" => Self::Executing {
                node: node_id(data),
            },
            "executed" => Self::Executed {
                node: node_id(data),
            },
            _ => Self::Other { kind: frame.kind },
        })
    }

    /// Fold this event into `progress`.
    ///
    /// Overall percent is driven by completed node count only: a node counts
    /// as completed when its sampling reaches 100% or when `executed` arrives.
    pub async fn apply(&self, progress: &Progress) {
        match self {
            Self::ExecutionStart => progress.on_log("Execution started").await,
            Self::Progress { node, value, max } => {
                if *max == 0 {
                    return;
                }
                let node_progress = u128::from(*value) * 100 / u128::from(*max);
                progress
                    .on_log(format!("Node {node} progress: {node_progress}%"))
                    .await;
                if node_progress == 100 {
                    progress.advance().await;
                }
            }
            Self::Executing { node } => {
                progress
                    .on_log(format!("Node {} started", node.as_deref().unwrap_or("-")))
                    .await;
            }
            Self::Executed { node } => {
                progress
                    .on_log(format!("Node {} finished", node.as_deref().unwrap_or("-")))
                    .await;
                progress.advance().await;
            }
            Self::Other { kind } => debug!(kind = %kind, "Unhandled event frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_frames() {
        assert_eq!(
            ExecutionEvent::parse(r#"{"type":"execution_start","data":{"prompt_id":"p"}}"#),
            Some(ExecutionEvent::ExecutionStart)
        );
        assert_eq!(
            ExecutionEvent::parse(r#"{"type":"progress","data":{"node":"3","value":5,"max":20}}"#),
            Some(ExecutionEvent::Progress {
                node: "3".into(),
                value: 5,
                max: 20
            })
        );
        assert_eq!(
            ExecutionEvent::parse(r#"{"type":"executing","data":{"node":null}}"#),
            Some(ExecutionEvent::Executing { node: None })
        );
        assert_eq!(
            ExecutionEvent::parse(r#"{"type":"status","data":{}}"#),
            Some(ExecutionEvent::Other {
                kind: "status".into()
            })
        );
        assert_eq!(ExecutionEvent::parse("not json"), None);
    }

    #[tokio::test]
    async fn sampling_only_counts_when_node_completes() {
        let progress = Progress::new();
        progress.set_total(4).await;

        ExecutionEvent::Progress {
            node: "3".into(),
            value: 10,
            max: 20,
        }
        .apply(&progress)
        .await;
        let snap = progress.snapshot().await;
        assert_eq!(snap.current, 0);
        assert_eq!(snap.percent, 0);
        assert_eq!(snap.log, "Node 3 progress: 50%");

        ExecutionEvent::Progress {
            node: "3".into(),
            value: 20,
            max: 20,
        }
        .apply(&progress)
        .await;
        ExecutionEvent::Executed {
            node: Some("9".into()),
        }
        .apply(&progress)
        .await;
        let snap = progress.snapshot().await;
        assert_eq!(snap.current, 2);
        assert_eq!(snap.percent, 50);
    }

    #[tokio::test]
    async fn huge_step_counts_do_not_overflow() {
        let progress = Progress::new();
        progress.set_total(1).await;
        ExecutionEvent::Progress {
            node: "5".into(),
            value: u64::MAX,
            max: u64::MAX,
        }
        .apply(&progress)
        .await;
        let snap = progress.snapshot().await;
        assert_eq!(snap.log, "Node 5 progress: 100%");
        assert_eq!(snap.current, 1);
    }

    #[tokio::test]
    async fn zero_max_is_ignored() {
        let progress = Progress::new();
        ExecutionEvent::Progress {
            node: "1".into(),
            value: 0,
            max: 0,
        }
        .apply(&progress)
        .await;
        assert_eq!(progress.snapshot().await, Default::default());
    }
}
