//! Error types for the identity store.

use thiserror::Error;

/// Errors that can occur when interacting with the identity store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No connection has been established, or the last one was lost
    #[error("Identity store is not connected")]
    NotConnected,

    /// Transport-level failure (connection refused, reset, pool exhausted)
    #[error("Identity store connection error: {0}")]
    Connection(String),

    /// The identity collection does not exist
    #[error("Identity collection '{0}' does not exist")]
    CollectionMissing(String),

    /// The existing collection was created with another fingerprint size
    #[error("Identity collection dimension mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: usize, found: usize },

    /// No record carries the requested label
    #[error("No identity enrolled under label '{0}'")]
    NotFound(String),

    #[error("Invalid identity label: {0}")]
    InvalidLabel(String),

    /// Query-level failure; the connection itself is still usable
    #[error("Identity store query error: {0}")]
    Query(String),
}

impl StoreError {
    /// Whether this error means the connection is broken (as opposed to a
    /// failed statement on a healthy connection).
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::NotConnected | StoreError::Connection(_))
    }
}
