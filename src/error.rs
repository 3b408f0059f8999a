//! Error types for the plugin manager.

use std::path::PathBuf;

/// Result type alias for plugin manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the plugin manager and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The config directory yielded zero usable networks.
    #[error("no usable network configuration in {}: {reason}", .dir.display())]
    Config { dir: PathBuf, reason: String },

    /// A requested network name is absent from the current registry.
    #[error("CNI network {0:?} not found")]
    NetworkNotFound(String),

    /// No explicit network list and no resolvable default network.
    #[error("cni config uninitialized")]
    NotInitialized,

    /// The plugin-execution engine reported a failure. `code` carries the
    /// CNI error code when the plugin emitted a structured error object.
    #[error("plugin {plugin:?} failed: {message}")]
    PluginExec {
        plugin: String,
        code: Option<u64>,
        message: String,
    },

    /// Querying an interface inside a pod's namespace failed.
    #[error("failed to inspect {ifname:?} in {netns}: {reason}")]
    Inspection {
        netns: String,
        ifname: String,
        reason: String,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
