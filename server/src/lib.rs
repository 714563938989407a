//! jitreg Server - OCI Distribution pull gateway.
//!
//! Serves `GET`/`HEAD` on `/v2/...` from the image store, materializing
//! tagged manifests on first request through the build coordinator.

pub mod error;
pub mod handler;
pub mod route;
pub mod server;

pub use handler::Gateway;
pub use server::{GatewayServer, RunningServer};
