//! jitreg Runtime
//!
//! The engine behind the gateway:
//!
//! - [`store`]: the image store contract and the disk-backed store that
//!   derives images from upstream base images
//! - [`source`]: control-plane sources of dynamic rules
//! - [`rules`]: the merged, lazily rebuilt rule set
//! - [`coordinator`]: single-flight builds per reference
//!
//! ```text
//!  request ──► BuildCoordinator ──► DynamicRules ──► RuleSet (static + source)
//!                     │
//!                     └──► ImageStore::build ──► <cache>/manifests, <cache>/blobs
//! ```

pub mod coordinator;
mod mutate;
pub mod registry;
pub mod rules;
pub mod source;
pub mod store;

pub use coordinator::BuildCoordinator;
pub use mutate::OCI_MANIFEST_MEDIA_TYPE;
pub use registry::{RegistryAuth, RegistryPuller};
pub use rules::DynamicRules;
pub use source::{DirectoryRuleSource, MemoryRuleSource, RuleSource, WatchEvent};
pub use store::{DiskImageStore, ImageStore};
