//! Error types for catsync-cache.

use thiserror::Error;

use catsync_core::{CatalogError, Kind, ResourceReference};

/// All errors surfaced by [`ResourceCache`](crate::ResourceCache).
#[derive(Debug, Error)]
pub enum CacheError {
    /// `subscribe` was called for a kind the cache does not watch.
    #[error("kind {0} is not watched by this cache")]
    UnknownKind(Kind),

    /// The service topic accepts a single subscriber.
    #[error("the service topic already has a subscriber")]
    DuplicateServiceSubscriber,

    /// The compare-and-swap write lost against a newer version.
    #[error("stale entry {reference} at modify index {modify_index}")]
    StaleEntry {
        reference: ResourceReference,
        modify_index: u64,
    },

    /// The wait was cancelled before every topic finished its first refresh.
    #[error("cache shut down before the initial sync completed")]
    Cancelled,

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}
