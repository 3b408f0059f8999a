//! CNI plugin manager for pod sandboxes
//!
//! This crate sits between a container runtime and the CNI plugin binaries:
//! - Discovers named networks from a config directory and hot-reloads them
//! - Serializes operations per pod while letting distinct pods run in parallel
//! - Attaches loopback plus the requested networks with deterministic
//!   interface naming ("lo", then "eth0", "eth1", ...)
//! - Reports current addressing for a pod's interfaces

pub mod config;
pub mod error;
pub mod exec;
pub mod locks;
pub mod manager;
pub mod monitor;
pub mod netns;
pub mod types;

// Re-export commonly used items
pub use error::{Error, Result};
pub use manager::PluginManager;
pub use types::{NetworkResult, PodNetwork, PortMapping};
