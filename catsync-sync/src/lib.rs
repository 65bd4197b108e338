//! catsync sync: reconciles a desired set of service registrations with
//! the external catalog.
//!
//! - [`desired`]: [`DesiredServiceSet`] snapshots and [`SyncDelta`]
//! - [`syncer`]: [`CatalogSyncer`]: full passes, reaper, service watchers
//! - [`backoff`]: bounded exponential [`Backoff`]
//! - [`metrics`]: counter and gauge names
//! - [`error`]: [`SyncError`]

pub mod backoff;
pub mod desired;
pub mod error;
pub mod metrics;
pub mod syncer;

pub use backoff::Backoff;
pub use desired::{DesiredServiceSet, SyncDelta};
pub use error::SyncError;
pub use syncer::{CatalogSyncer, ReconcileReport, SyncStatus, SyncerConfig};
