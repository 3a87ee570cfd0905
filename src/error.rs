//! Error types for the auto-configuration core

use thiserror::Error;

/// Main error type for auto-configuration operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing collaborator or invalid configuration option
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence I/O failure
    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted file exists but cannot be decoded
    #[error("corrupt persisted auto-config: {0}")]
    CorruptPersistence(String),

    /// Network or remote failure on the bootstrap RPC
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The operation was cancelled before it could complete
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The bootstrap response is invalid or unchainable
    #[error("invalid auto-config response: {0}")]
    Assembly(String),

    /// The TLS configurator rejected the new material
    #[error("TLS update failed: {0}")]
    TlsInstall(String),

    /// Start was called while the control loop was already running
    #[error("auto-config is already running")]
    AlreadyRunning,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an RPC error with the given message
    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    /// Create a cancellation error with the given message
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create an assembly error with the given message
    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::Assembly(msg.into())
    }

    /// Create a TLS install error with the given message
    pub fn tls_install(msg: impl Into<String>) -> Self {
        Self::TlsInstall(msg.into())
    }
}
