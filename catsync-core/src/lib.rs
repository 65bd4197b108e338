//! catsync core library: domain types, the catalog client seam, the
//! in-memory catalog, and supervised tasks.
//!
//! Public API surface:
//! - [`types`]: catalog references, entries, registrations, query options
//! - [`client`]: [`CatalogClient`], the external catalog seam
//! - [`memory`]: [`MemoryCatalog`], an in-process catalog
//! - [`tasks`]: [`TaskSet`] with structured shutdown
//! - [`error`]: [`CatalogError`]

pub mod client;
pub mod error;
pub mod memory;
pub mod tasks;
pub mod types;

pub use client::CatalogClient;
pub use error::CatalogError;
pub use memory::{CatalogOp, MemoryCatalog, Operation};
pub use tasks::{ShutdownReport, TaskOutcome, TaskSet};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    AgentService, CatalogDeregistration, CatalogEntry, CatalogRegistration, CatalogService,
    HealthCheck, HealthStatus, Kind, NamespacedName, QueryMeta, QueryOptions, ResourceReference,
};
