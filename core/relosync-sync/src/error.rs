//! Error types for the sync layer.

use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Send or acknowledgement failure while connected.
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// A request was not acknowledged in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// No `sync:response` arrived for the type in time.
    #[error("sync for {entity_type} timed out after {waited:?}")]
    SyncTimeout {
        entity_type: String,
        waited: Duration,
    },

    /// The server acknowledged with `success: false`.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An external create/update/delete endpoint failed.
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// Entity not present in the cache or view.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// The coordinator has not been initialized or was disposed.
    #[error("coordinator not initialized")]
    NotInitialized,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the failure is a connectivity problem, as opposed to a
    /// rejection the caller should surface.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        Self::Endpoint(format!("{err:#}"))
    }
}
