//! Generation tools dispatched from a timeline item's execute queue.

pub mod frames;
pub mod img2video;
pub mod imgedit;
pub mod registry;
pub mod text2img;
pub mod tool;

pub use frames::{FfmpegFrameExtractor, FrameExtractor};
pub use registry::{ToolDeps, ToolRegistry};
pub use tool::{Tool, ToolContext};
