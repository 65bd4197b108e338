//! The external catalog seen through one async trait.
//!
//! Implementations are expected to reconnect on their own; callers treat every
//! method as a single remote call that may fail with a [`CatalogError`].

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::types::{
    CatalogDeregistration, CatalogEntry, CatalogRegistration, CatalogService, Kind, QueryMeta,
    QueryOptions, ResourceReference,
};

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// List every entry of `kind`. Blocks while `opts.wait_index` is current.
    async fn list_entries(
        &self,
        kind: &Kind,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogEntry>, QueryMeta), CatalogError>;

    async fn get_entry(
        &self,
        reference: &ResourceReference,
    ) -> Result<Option<CatalogEntry>, CatalogError>;

    /// Compare-and-swap write. Returns `false` when `entry.modify_index` no
    /// longer matches the stored value; nothing is written in that case.
    /// An index of zero only succeeds if the entry does not exist yet.
    async fn cas_entry(&self, entry: &CatalogEntry) -> Result<bool, CatalogError>;

    async fn delete_entry(&self, reference: &ResourceReference) -> Result<(), CatalogError>;

    /// Every service instance in scope, flattened. Blocking like `list_entries`.
    async fn list_services(
        &self,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CatalogError>;

    /// Instances of one service, optionally filtered by `opts.tag`.
    async fn service_instances(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CatalogError>;

    /// Instances registered on `node`, optionally filtered by `opts.tag`.
    async fn node_services(
        &self,
        node: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CatalogError>;

    async fn register(&self, registration: &CatalogRegistration) -> Result<(), CatalogError>;

    async fn deregister(&self, deregistration: &CatalogDeregistration)
        -> Result<(), CatalogError>;

    /// Create `namespace` if missing, attaching `cross_namespace_policy` when
    /// given. Returns `true` when the namespace was created by this call.
    async fn ensure_namespace(
        &self,
        namespace: &str,
        cross_namespace_policy: Option<&str>,
    ) -> Result<bool, CatalogError>;
}
