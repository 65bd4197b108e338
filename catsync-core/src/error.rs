//! Error types for catsync-core.

use thiserror::Error;

/// All errors a [`CatalogClient`](crate::client::CatalogClient) can return.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog could not be reached (connection refused, DNS, reset).
    #[error("catalog unreachable: {0}")]
    Unavailable(String),

    /// The catalog answered with a non-success status.
    #[error("catalog returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The requested namespace does not exist and was not created.
    #[error("namespace {0} does not exist")]
    NamespaceMissing(String),

    /// A response body could not be decoded.
    #[error("catalog payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CatalogError {
    /// Timeouts and unreachable servers are expected on long polls.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Unavailable(_) => true,
            CatalogError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
