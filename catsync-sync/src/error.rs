//! Error types for catsync-sync.

use thiserror::Error;

use catsync_core::CatalogError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A retried query kept failing until the retry budget ran out.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: CatalogError,
    },

    #[error("cancelled")]
    Cancelled,
}
