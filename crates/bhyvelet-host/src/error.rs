//! Error types for bhyvelet-host.

use crate::command::CommandFailure;
use thiserror::Error;

/// Result type alias for bhyvelet-host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors that can occur while touching host resources.
#[derive(Debug, Error)]
pub enum HostError {
    /// The current OS user could not be resolved
    #[error("cannot resolve current user: {0}")]
    Identity(String),

    /// The OS entropy source failed
    #[error("random source unavailable: {0}")]
    Randomness(String),

    /// Every candidate device was probed and none was free
    #[error("no free {kind} device after probing {probed} candidates")]
    Exhausted { kind: &'static str, probed: u32 },

    /// No lease matched the MAC address
    #[error("no DHCP lease for {mac}")]
    NotFound { mac: String },

    /// External command ran and exited non-zero
    #[error("{0}")]
    Process(Box<CommandFailure>),

    /// External command could not be started at all
    #[error("failed to start [{command}]: {source}")]
    ExecutionStart {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command output did not have the expected shape
    #[error("failed to parse output of [{command}]: {output}")]
    Parse { command: String, output: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Whether this error means "nothing matched" rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HostError::NotFound { .. })
    }
}
