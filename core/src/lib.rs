//! jitreg Core - Foundational Types
//!
//! Errors, configuration records, match-mutate rules and gateway events
//! shared by the jitreg runtime and server crates.

pub mod config;
pub mod digest;
pub mod error;
pub mod event;
pub mod rule;

// Re-export commonly used types
pub use config::{GatewayConfig, ImageResource, ImageSpec, ObjectMeta};
pub use digest::is_digest;
pub use error::{GatewayError, Result};
pub use event::{EventEmitter, GatewayEvent};
pub use rule::{Mutation, Rule, RuleSet};

/// jitreg version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
