//! ComfyUI backend: wire protocol, event frames, workflow templates and the
//! generation model built on top of them.

pub mod client;
pub mod events;
pub mod model;
pub mod workflow;

pub use client::{ComfyUiClient, UploadedImage, WorkflowOutcome};
pub use events::ExecutionEvent;
pub use model::{ComfyUiModel, GenerationModel, ModelResult};
pub use workflow::Workflow;
