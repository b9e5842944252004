//! Core types and shared infrastructure for the matrix fabric.
//!
//! Everything here is process-agnostic: the hub, the daemon, and operator
//! tooling all build on these entities, the configuration loader, the
//! lockfiles, and the shutdown coordinator.

pub mod access;
pub mod config;
pub mod lockfile;
pub mod shutdown;
pub mod types;

pub use config::FabricConfig;
pub use types::*;
