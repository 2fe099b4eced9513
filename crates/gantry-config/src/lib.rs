//! Parse `gantry.toml` manifests and resolve layered build properties.

pub mod manifest;
pub mod properties;

pub use manifest::{ModuleManifest, WorkspaceManifest};
pub use properties::{PropertySource, PropertyStore};
