//! Stator error abstractions.

use thiserror::Error;

/// Errors returned by the coordination store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached; transient, retried with backoff by the store handle.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    /// An optimistic write lost a race; the caller must re-read and retry its operation.
    #[error("version conflict at {path}: expected {expected}, found {actual}")]
    VersionConflict { path: String, expected: i64, actual: i64 },
    /// The client session is no longer valid; all ephemerals owned by it are gone.
    #[error("session expired")]
    SessionExpired,
    /// A create targeted a path which already holds a node.
    #[error("node already exists at {0}")]
    NodeExists(String),
    /// No node exists at the given path.
    #[error("no node at {0}")]
    NotFound(String),
}

/// A result type for store layer operations.
pub type StoreResult<T> = ::std::result::Result<T, StoreError>;

/// The error type used to indicate that a component must shut down.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
