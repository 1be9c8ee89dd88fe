//! Persistence collaborators: YAML key-value documents and managed resources.

pub mod resources;
pub mod yaml;

pub use resources::{FileResourceStore, MediaType, Resource, ResourceStore};
pub use yaml::{Document, YamlDocument, load_yaml, save_yaml};
