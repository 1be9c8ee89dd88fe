//! Filmeto pipeline: per-timeline-item generation task orchestration.
//!
//! Tasks are submitted to a timeline item's `TaskManager`, persisted under
//! the item's `tasks/` directory, executed by tools against a ComfyUI
//! backend, and folded back into project resources and item config.

pub mod comfy;
pub mod config;
pub mod error;
pub mod progress;
pub mod project;
pub mod queue;
pub mod store;
pub mod task;
pub mod tools;
