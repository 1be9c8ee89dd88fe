//! Durable task bookkeeping for one timeline item.

pub mod manager;
pub mod model;
pub mod state;

pub use manager::{CREATE_CHANNEL, EXECUTE_CHANNEL, TaskEvent, TaskManager};
pub use model::{Task, TaskOptions, TaskResult};
pub use state::TaskStatus;
