//! Error types for the task pipeline.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors talking to the generation backend.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors for YAML documents and managed resources.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// Task bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Input image not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Missing task option: {0}")]
    MissingOption(&'static str),

    #[error("Timeline item {0} is not available")]
    ItemUnavailable(usize),

    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Errors while folding a finished task back into project state.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Resource registration failed: {0}")]
    Resource(#[from] StoreError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
