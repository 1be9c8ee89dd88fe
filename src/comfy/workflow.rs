//! Workflow templates.
//!
//! A template is `<dir>/<name>.json`, either `{"prompt": {...}, "output_nodes": [...]}`
//! or a bare node graph. Placeholders are substituted on the parsed value so
//! prompt text never has to be JSON-escaped by hand.

use std::path::Path;

use serde_json::Value;

use crate::error::ClientError;

/// Text placeholder for the user prompt.
pub const PROMPT_PLACEHOLDER: &str = "$prompt";
/// Text placeholders for the uploaded input image name.
pub const IMAGE_PLACEHOLDERS: [&str; 2] = ["$image", "$inputImage"];
/// Numeric seed placeholders, replaced with a fresh random seed per run.
/// The image templates use the first, the video template the second.
pub const SEED_PLACEHOLDERS: [u64; 2] = [818381787480535, 633890936133287];

pub const TEXT2IMAGE: &str = "text2image";
pub const IMAGE_EDIT: &str = "image_edit";
pub const IMAGE2VIDEO: &str = "image2video";

/// A backend node graph plus the node ids whose outputs should be downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub graph: Value,
    pub output_nodes: Vec<String>,
}

impl Workflow {
    /// Build from a parsed template document.
    pub fn from_value(value: Value) -> Result<Self, ClientError> {
        let (graph, explicit) = match value {
            Value::Object(mut map) if map.get("prompt").is_some_and(Value::is_object) => {
                let graph = map.remove("prompt").unwrap_or_default();
                let outputs = map.remove("output_nodes").and_then(|v| match v {
                    Value::Array(ids) => Some(
                        ids.iter()
                            .filter_map(|id| match id {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                });
                (graph, outputs)
            }
            Value::Object(map) => (Value::Object(map), None),
            _ => {
                return Err(ClientError::InvalidWorkflow(
                    "template must be a JSON object".to_string(),
                ));
            }
        };

        let output_nodes = explicit.unwrap_or_else(|| default_output_nodes(&graph));
        Ok(Self {
            graph,
            output_nodes,
        })
    }

    /// Load `<dir>/<name>.json`.
    pub async fn load(dir: &Path, name: &str) -> Result<Self, ClientError> {
        let path = dir.join(format!("{name}.json"));
        let raw = tokio::fs::read_to_string(&path).await?;
        let value: Value = serde_json::from_str(&raw)?;
        Self::from_value(value)
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.as_object().map_or(0, |m| m.len())
    }

    /// Replace placeholders throughout the graph.
    pub fn substitute(&mut self, prompt: &str, image: Option<&str>, seed: u32) {
        substitute_value(&mut self.graph, prompt, image, seed);
    }
}

fn default_output_nodes(graph: &Value) -> Vec<String> {
    let Some(nodes) = graph.as_object() else {
        return Vec::new();
    };
    nodes
        .iter()
        .filter(|(_, node)| {
            node.get("class_type")
                .and_then(Value::as_str)
                .is_some_and(|c| c.contains("Save") || c == "VHS_VideoCombine")
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn substitute_value(value: &mut Value, prompt: &str, image: Option<&str>, seed: u32) {
    if value.as_u64().is_some_and(|n| SEED_PLACEHOLDERS.contains(&n)) {
        *value = Value::from(seed);
        return;
    }
    match value {
        Value::String(s) => {
            if s.contains(PROMPT_PLACEHOLDER) {
                *s = s.replace(PROMPT_PLACEHOLDER, prompt);
            }
            if let Some(image) = image {
                for placeholder in IMAGE_PLACEHOLDERS {
                    if s.contains(placeholder) {
                        *s = s.replace(placeholder, image);
                    }
                }
            }
            for placeholder in SEED_PLACEHOLDERS {
                let seed_text = placeholder.to_string();
                if s.contains(&seed_text) {
                    *s = s.replace(&seed_text, &seed.to_string());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, prompt, image, seed);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, prompt, image, seed);
            }
        }
        _ => {}
    }
}
