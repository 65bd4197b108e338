//! catsync cache: a watch-based mirror of the external catalog that
//! notifies subscribers about changed entries.
//!
//! - [`cache`]: [`ResourceCache`] and [`CacheConfig`]
//! - [`diff`]: [`ReferenceMap`] snapshots and their diff
//! - [`subscription`]: [`Subscription`] handles and [`Delivery`] modes
//! - [`error`]: [`CacheError`]

pub mod cache;
pub mod diff;
pub mod error;
pub mod subscription;

pub use cache::{CacheConfig, ResourceCache, META_KEY_DATACENTER, META_KEY_SOURCE_NAME};
pub use diff::{ReferenceMap, Versioned};
pub use error::CacheError;
pub use subscription::{Delivery, Subscription, Translator, DEFAULT_CAPACITY};
