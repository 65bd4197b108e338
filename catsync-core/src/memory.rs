//! In-process catalog with real blocking-query semantics.
//!
//! Every mutation bumps one global index and wakes blocked readers through a
//! `watch` channel. A blocking read with `wait_index = N` returns as soon as
//! the index moves past `N`, or after its wait time with the unchanged data.
//!
//! Namespace and partition filters follow the catalog convention: `None` and
//! `"*"` select everything, any other value selects exactly that scope.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::client::CatalogClient;
use crate::error::CatalogError;
use crate::types::{
    CatalogDeregistration, CatalogEntry, CatalogRegistration, CatalogService, Kind, QueryMeta,
    QueryOptions, ResourceReference,
};

/// Default long-poll duration when a blocking query carries no wait time.
pub const DEFAULT_BLOCKING_WAIT: Duration = Duration::from_secs(5 * 60);

/// Operations that can be made to fail with [`MemoryCatalog::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListEntries,
    GetEntry,
    CasEntry,
    DeleteEntry,
    ListServices,
    ServiceInstances,
    NodeServices,
    Register,
    Deregister,
    EnsureNamespace,
}

/// One mutating call observed by the catalog, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOp {
    Register { node: String, service_id: String },
    Deregister { node: String, service_id: String },
    CasWrite { reference: ResourceReference, accepted: bool },
    Delete { reference: ResourceReference },
    NamespaceCreated { namespace: String },
}

type ServiceKey = (String, String, String, String);

#[derive(Debug, Default)]
struct State {
    index: u64,
    entries: BTreeMap<ResourceReference, CatalogEntry>,
    /// Keyed by (partition, namespace, node, service id).
    services: BTreeMap<ServiceKey, CatalogService>,
    namespaces: BTreeSet<String>,
    require_namespaces: bool,
    faults: HashMap<Operation, u32>,
    ops: Vec<CatalogOp>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn take_fault(&mut self, op: Operation) -> Result<(), CatalogError> {
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(CatalogError::Unavailable(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        namespace.is_empty() || namespace == "default" || self.namespaces.contains(namespace)
    }
}

/// First index handed out. Blocking-query clients treat zero as "do not
/// block", so an untouched catalog must never report it.
const INITIAL_INDEX: u64 = 1;

/// A [`CatalogClient`] that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryCatalog {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
    default_wait: Duration,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(INITIAL_INDEX);
        Self {
            state: Mutex::new(State {
                index: INITIAL_INDEX,
                ..State::default()
            }),
            changed,
            default_wait: DEFAULT_BLOCKING_WAIT,
        }
    }

    /// Registrations into unknown namespaces fail with
    /// [`CatalogError::NamespaceMissing`] until the namespace is ensured.
    pub fn with_namespaces_required(self) -> Self {
        self.lock().require_namespaces = true;
        self
    }

    pub fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, index: u64) {
        self.changed.send_replace(index);
    }

    /// Make the next `times` calls of `op` fail with a transient error.
    pub fn fail_next(&self, op: Operation, times: u32) {
        *self.lock().faults.entry(op).or_default() += times;
    }

    /// Current catalog index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Store `entry` directly, stamping it with a fresh modify index.
    pub fn insert_entry(&self, mut entry: CatalogEntry) -> CatalogEntry {
        let index = {
            let mut state = self.lock();
            let index = state.bump();
            entry.modify_index = index;
            state.entries.insert(entry.reference.clone(), entry.clone());
            index
        };
        self.publish(index);
        entry
    }

    /// Remove an entry without recording an operation.
    pub fn remove_entry(&self, reference: &ResourceReference) -> bool {
        let index = {
            let mut state = self.lock();
            if state.entries.remove(reference).is_none() {
                return false;
            }
            state.bump()
        };
        self.publish(index);
        true
    }

    /// Store a service instance directly, stamping a fresh modify index.
    pub fn insert_service(&self, mut service: CatalogService) -> CatalogService {
        let index = {
            let mut state = self.lock();
            let index = state.bump();
            service.modify_index = index;
            state.services.insert(service_key(&service), service.clone());
            index
        };
        self.publish(index);
        service
    }

    pub fn create_namespace(&self, namespace: &str) {
        let index = {
            let mut state = self.lock();
            if !state.namespaces.insert(namespace.to_owned()) {
                return;
            }
            state.bump()
        };
        self.publish(index);
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn services(&self) -> Vec<CatalogService> {
        self.lock().services.values().cloned().collect()
    }

    /// Instances of `service_name` across every node and namespace.
    pub fn instances_of(&self, service_name: &str) -> Vec<CatalogService> {
        self.lock()
            .services
            .values()
            .filter(|svc| svc.service_name == service_name)
            .cloned()
            .collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    pub fn ops(&self) -> Vec<CatalogOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Wait until the index moves past `opts.wait_index` or the wait time
    /// elapses. Non-blocking when `wait_index` is zero.
    async fn block_on_index(&self, opts: &QueryOptions) {
        if opts.wait_index == 0 {
            return;
        }
        let mut rx = self.changed.subscribe();
        if *rx.borrow_and_update() > opts.wait_index {
            return;
        }
        let wait = opts.wait_time.unwrap_or(self.default_wait);
        let target = opts.wait_index;
        let _ = tokio::time::timeout(wait, rx.wait_for(|index| *index > target)).await;
    }

    fn check_fault(&self, op: Operation) -> Result<(), CatalogError> {
        self.lock().take_fault(op)
    }

    fn select_services<F>(&self, opts: &QueryOptions, keep: F) -> (Vec<CatalogService>, QueryMeta)
    where
        F: Fn(&CatalogService) -> bool,
    {
        let state = self.lock();
        let services = state
            .services
            .values()
            .filter(|svc| scope_matches(opts.namespace.as_deref(), &svc.namespace))
            .filter(|svc| scope_matches(opts.partition.as_deref(), &svc.partition))
            .filter(|svc| opts.tag.as_deref().map_or(true, |tag| svc.has_tag(tag)))
            .filter(|svc| keep(svc))
            .cloned()
            .collect();
        (
            services,
            QueryMeta {
                last_index: state.index,
            },
        )
    }
}

fn scope_matches(filter: Option<&str>, value: &str) -> bool {
    match filter {
        None | Some(QueryOptions::ALL_NAMESPACES) => true,
        Some(expected) => expected == value,
    }
}

fn service_key(service: &CatalogService) -> ServiceKey {
    (
        service.partition.clone(),
        service.namespace.clone(),
        service.node.clone(),
        service.service_id.clone(),
    )
}

fn service_from_registration(registration: &CatalogRegistration) -> CatalogService {
    let svc = &registration.service;
    CatalogService {
        node: registration.node.clone(),
        service_id: svc.id.clone(),
        service_name: svc.service.clone(),
        namespace: svc.namespace.clone(),
        partition: svc.partition.clone(),
        address: if svc.address.is_empty() {
            registration.address.clone()
        } else {
            svc.address.clone()
        },
        port: svc.port,
        tags: svc.tags.clone(),
        meta: svc.meta.clone(),
        modify_index: 0,
    }
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn list_entries(
        &self,
        kind: &Kind,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogEntry>, QueryMeta), CatalogError> {
        self.check_fault(Operation::ListEntries)?;
        self.block_on_index(opts).await;
        let state = self.lock();
        let entries = state
            .entries
            .values()
            .filter(|entry| &entry.reference.kind == kind)
            .filter(|entry| scope_matches(opts.namespace.as_deref(), &entry.reference.namespace))
            .filter(|entry| scope_matches(opts.partition.as_deref(), &entry.reference.partition))
            .cloned()
            .collect();
        Ok((
            entries,
            QueryMeta {
                last_index: state.index,
            },
        ))
    }

    async fn get_entry(
        &self,
        reference: &ResourceReference,
    ) -> Result<Option<CatalogEntry>, CatalogError> {
        self.check_fault(Operation::GetEntry)?;
        Ok(self.lock().entries.get(reference).cloned())
    }

    async fn cas_entry(&self, entry: &CatalogEntry) -> Result<bool, CatalogError> {
        let index = {
            let mut state = self.lock();
            state.take_fault(Operation::CasEntry)?;
            let current = state.entries.get(&entry.reference).map(|e| e.modify_index);
            let accepted = match current {
                None => entry.modify_index == 0,
                Some(index) => index == entry.modify_index,
            };
            state.ops.push(CatalogOp::CasWrite {
                reference: entry.reference.clone(),
                accepted,
            });
            if !accepted {
                return Ok(false);
            }
            let index = state.bump();
            let mut stored = entry.clone();
            stored.modify_index = index;
            state.entries.insert(stored.reference.clone(), stored);
            index
        };
        self.publish(index);
        Ok(true)
    }

    async fn delete_entry(&self, reference: &ResourceReference) -> Result<(), CatalogError> {
        let index = {
            let mut state = self.lock();
            state.take_fault(Operation::DeleteEntry)?;
            state.ops.push(CatalogOp::Delete {
                reference: reference.clone(),
            });
            if state.entries.remove(reference).is_none() {
                return Ok(());
            }
            state.bump()
        };
        self.publish(index);
        Ok(())
    }

    async fn list_services(
        &self,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CatalogError> {
        self.check_fault(Operation::ListServices)?;
        self.block_on_index(opts).await;
        Ok(self.select_services(opts, |_| true))
    }

    async fn service_instances(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CatalogError> {
        self.check_fault(Operation::ServiceInstances)?;
        self.block_on_index(opts).await;
        Ok(self.select_services(opts, |svc| svc.service_name == service))
    }

    async fn node_services(
        &self,
        node: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CatalogError> {
        self.check_fault(Operation::NodeServices)?;
        self.block_on_index(opts).await;
        Ok(self.select_services(opts, |svc| svc.node == node))
    }

    async fn register(&self, registration: &CatalogRegistration) -> Result<(), CatalogError> {
        let index = {
            let mut state = self.lock();
            state.take_fault(Operation::Register)?;
            let namespace = &registration.service.namespace;
            if state.require_namespaces && !state.namespace_exists(namespace) {
                return Err(CatalogError::NamespaceMissing(namespace.clone()));
            }
            state.ops.push(CatalogOp::Register {
                node: registration.node.clone(),
                service_id: registration.service.id.clone(),
            });

            let mut service = service_from_registration(registration);
            let key = service_key(&service);
            if let Some(existing) = state.services.get(&key) {
                service.modify_index = existing.modify_index;
                if existing == &service {
                    return Ok(());
                }
            }
            let index = state.bump();
            service.modify_index = index;
            state.services.insert(key, service);
            index
        };
        self.publish(index);
        Ok(())
    }

    async fn deregister(
        &self,
        deregistration: &CatalogDeregistration,
    ) -> Result<(), CatalogError> {
        let index = {
            let mut state = self.lock();
            state.take_fault(Operation::Deregister)?;
            state.ops.push(CatalogOp::Deregister {
                node: deregistration.node.clone(),
                service_id: deregistration.service_id.clone(),
            });
            let key = (
                deregistration.partition.clone(),
                deregistration.namespace.clone(),
                deregistration.node.clone(),
                deregistration.service_id.clone(),
            );
            if state.services.remove(&key).is_none() {
                return Ok(());
            }
            state.bump()
        };
        self.publish(index);
        Ok(())
    }

    async fn ensure_namespace(
        &self,
        namespace: &str,
        _cross_namespace_policy: Option<&str>,
    ) -> Result<bool, CatalogError> {
        let index = {
            let mut state = self.lock();
            state.take_fault(Operation::EnsureNamespace)?;
            if state.namespace_exists(namespace) {
                return Ok(false);
            }
            state.namespaces.insert(namespace.to_owned());
            state.ops.push(CatalogOp::NamespaceCreated {
                namespace: namespace.to_owned(),
            });
            state.bump()
        };
        self.publish(index);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentService;

    fn registration(node: &str, id: &str, name: &str, namespace: &str) -> CatalogRegistration {
        CatalogRegistration {
            node: node.into(),
            address: "127.0.0.1".into(),
            datacenter: "dc1".into(),
            service: AgentService {
                id: id.into(),
                service: name.into(),
                namespace: namespace.into(),
                tags: vec!["k8s".into()],
                ..AgentService::default()
            },
            check: None,
        }
    }

    #[tokio::test]
    async fn identical_register_does_not_bump_index() {
        let catalog = MemoryCatalog::new();
        let reg = registration("k8s-sync", "web-1", "web", "");
        catalog.register(&reg).await.expect("register");
        let after_first = catalog.index();
        catalog.register(&reg).await.expect("register again");
        assert_eq!(catalog.index(), after_first);
        assert_eq!(catalog.services().len(), 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_index_without_writing() {
        let catalog = MemoryCatalog::new();
        let stored = catalog.insert_entry(CatalogEntry::new(
            ResourceReference::new("http-route", "web"),
            0,
        ));

        let mut stale = stored.clone();
        stale.modify_index = stored.modify_index - 1;
        stale.payload = serde_json::json!({"changed": true});
        assert!(!catalog.cas_entry(&stale).await.expect("cas"));
        assert_eq!(catalog.entries()[0].payload, serde_json::Value::Null);

        assert!(catalog.cas_entry(&stored).await.expect("cas"));
        assert!(catalog.entries()[0].modify_index > stored.modify_index);
    }

    #[tokio::test]
    async fn cas_with_zero_index_only_creates() {
        let catalog = MemoryCatalog::new();
        let entry = CatalogEntry::new(ResourceReference::new("http-route", "web"), 0);
        assert!(catalog.cas_entry(&entry).await.expect("create"));
        assert!(!catalog.cas_entry(&entry).await.expect("second create"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_list_wakes_on_change() {
        let catalog = std::sync::Arc::new(MemoryCatalog::new());
        catalog.insert_entry(CatalogEntry::new(ResourceReference::new("k", "a"), 0));
        let index = catalog.index();

        let reader = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                let opts = QueryOptions::blocking(index, Duration::from_secs(60));
                catalog
                    .list_entries(&Kind::from("k"), &opts)
                    .await
                    .expect("list")
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        catalog.insert_entry(CatalogEntry::new(ResourceReference::new("k", "b"), 0));

        let (entries, meta) = reader.await.expect("join");
        assert_eq!(entries.len(), 2);
        assert!(meta.last_index > index);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_list_returns_unchanged_after_wait_time() {
        let catalog = MemoryCatalog::new();
        catalog.insert_entry(CatalogEntry::new(ResourceReference::new("k", "a"), 0));
        let index = catalog.index();

        let opts = QueryOptions::blocking(index, Duration::from_secs(10));
        let (entries, meta) = catalog
            .list_entries(&Kind::from("k"), &opts)
            .await
            .expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(meta.last_index, index);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalog_reports_a_blockable_index() {
        let catalog = MemoryCatalog::new();
        let (entries, meta) = catalog
            .list_entries(&Kind::from("k"), &QueryOptions::default())
            .await
            .expect("list");
        assert!(entries.is_empty());
        assert!(meta.last_index > 0);

        let started = tokio::time::Instant::now();
        let opts = QueryOptions::blocking(meta.last_index, Duration::from_secs(10));
        catalog
            .list_entries(&Kind::from("k"), &opts)
            .await
            .expect("blocking list");
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let catalog = MemoryCatalog::new();
        catalog.fail_next(Operation::Register, 1);
        let reg = registration("n", "a", "a", "");
        assert!(catalog.register(&reg).await.is_err());
        assert!(catalog.register(&reg).await.is_ok());
    }

    #[tokio::test]
    async fn namespaces_required_rejects_until_ensured() {
        let catalog = MemoryCatalog::new().with_namespaces_required();
        let reg = registration("n", "a", "a", "team-a");
        let err = catalog.register(&reg).await.unwrap_err();
        assert!(matches!(err, CatalogError::NamespaceMissing(ref ns) if ns == "team-a"));

        assert!(catalog.ensure_namespace("team-a", None).await.expect("ensure"));
        assert!(!catalog.ensure_namespace("team-a", None).await.expect("ensure again"));
        catalog.register(&reg).await.expect("register");
    }

    #[tokio::test]
    async fn node_services_filters_by_node_and_tag() {
        let catalog = MemoryCatalog::new();
        catalog
            .register(&registration("k8s-sync", "a-1", "a", ""))
            .await
            .expect("register");
        catalog
            .register(&registration("other-node", "b-1", "b", ""))
            .await
            .expect("register");
        let mut untagged = registration("k8s-sync", "c-1", "c", "");
        untagged.service.tags.clear();
        catalog.register(&untagged).await.expect("register");

        let opts = QueryOptions {
            tag: Some("k8s".into()),
            ..QueryOptions::default()
        };
        let (services, _) = catalog
            .node_services("k8s-sync", &opts)
            .await
            .expect("node services");
        let ids: Vec<_> = services.iter().map(|s| s.service_id.as_str()).collect();
        assert_eq!(ids, vec!["a-1"]);
    }
}
