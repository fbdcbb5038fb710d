//! Error types for the meshlock protocol layer.
//!
//! All fallible operations in this crate return [`Result`], an alias over
//! the unified [`MeshLockError`] enum. Errors on the message up-path never
//! propagate back into the transport; they are logged, counted and the
//! offending message is dropped.

use thiserror::Error;

/// Main error type for meshlock operations.
#[derive(Error, Debug)]
pub enum MeshLockError {
    // Wire errors
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("unknown request type: {0}")]
    UnknownRequestType(u8),

    #[error("invalid lock name: {0}")]
    InvalidLockName(String),

    // Transport errors
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    // Wait errors
    #[error("lock wait interrupted")]
    Interrupted,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl MeshLockError {
    /// Check whether this error came out of the message decode path.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MeshLockError::ProtocolDecode(_) | MeshLockError::UnknownRequestType(_)
        )
    }

    /// Check whether this error is an interrupted lock wait.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, MeshLockError::Interrupted)
    }
}

/// Result type alias for meshlock operations.
pub type Result<T> = std::result::Result<T, MeshLockError>;
