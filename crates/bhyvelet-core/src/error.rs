//! Error types for bhyvelet-core.

use crate::instance::InstanceState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for bhyvelet-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from bhyvelet-host
    #[error(transparent)]
    Host(#[from] bhyvelet_host::HostError),

    /// The guest never showed up in the lease file
    #[error("no IP address after {attempts} attempts ({waited:?})")]
    Timeout { attempts: u32, waited: Duration },

    /// A file-backed resource could not be created, read, or removed
    #[error("{}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation not valid in the current state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        expected: InstanceState,
        actual: InstanceState,
    },

    /// Operation requires a running guest
    #[error("instance {0} is not running")]
    NotRunning(String),

    /// The hypervisor kept the VM alive through every destroy attempt
    #[error("VM {identity} still present after {attempts} destroy attempts")]
    TeardownIncomplete { identity: String, attempts: u32 },

    /// The guest got an address but never accepted connections
    #[error("{addr} not reachable after {waited:?}")]
    Unreachable { addr: SocketAddr, waited: Duration },

    /// Host is missing something the guest needs
    #[error("host check failed: {0}")]
    Precheck(String),

    /// Invalid machine settings
    #[error("invalid settings: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn resource(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CoreError::Resource { path, source }
    }
}
