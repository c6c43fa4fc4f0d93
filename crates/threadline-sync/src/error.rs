//! Error types for the sync layer.

use std::sync::Arc;

use thiserror::Error;
use threadline_pb::PbError;

/// Errors surfaced by the query cache and realtime list resources.
///
/// Cloneable so a single failure can be both returned to the caller and kept
/// in a resource's status.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The remote backend rejected a call.
    #[error("remote error: {0}")]
    Remote(Arc<PbError>),

    /// The resource was closed.
    #[error("resource is closed")]
    Closed,

    /// A merge function refused an event.
    #[error("merge failed: {0}")]
    Merge(String),

    /// A cache entry holds a value of another type than requested.
    #[error("cache entry {key} holds a different type")]
    CacheTypeMismatch { key: String },

    /// Parameters could not be turned into a cache key.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

impl SyncError {
    /// The underlying remote error, if this is one.
    pub fn remote(&self) -> Option<&PbError> {
        match self {
            SyncError::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the remote reported that the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.remote(), Some(PbError::NotFound { .. }))
    }
}

impl From<PbError> for SyncError {
    fn from(e: PbError) -> Self {
        SyncError::Remote(Arc::new(e))
    }
}
