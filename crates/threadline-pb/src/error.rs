//! Error types for the PocketBase client.

use thiserror::Error;

/// Errors that can occur when talking to a PocketBase backend.
#[derive(Debug, Error)]
pub enum PbError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record not found.
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Error body returned by the API (`{"code", "message", "data"}`).
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        data: serde_json::Value,
    },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Realtime transport error.
    #[error("realtime error: {0}")]
    Realtime(String),
}

impl PbError {
    /// Whether the error is worth retrying at the transport level.
    pub fn is_transient(&self) -> bool {
        match self {
            PbError::Http(e) => e.is_connect() || e.is_timeout(),
            PbError::Api { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    /// HTTP status associated with the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            PbError::NotFound { .. } => Some(404),
            PbError::Api { status, .. } => Some(*status),
            PbError::RateLimited { .. } => Some(429),
            PbError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
