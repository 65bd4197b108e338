//! The watch-based resource cache.
//!
//! One refresh loop per kind (plus one for service instances) long-polls the
//! catalog, swaps the kind's map in whole, diffs it against the previous map
//! and fans the changes out to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use catsync_core::memory::DEFAULT_BLOCKING_WAIT;
use catsync_core::{
    CancellationToken, CatalogClient, CatalogEntry, CatalogError, CatalogService, Kind,
    NamespacedName, QueryOptions, ResourceReference, TaskOutcome, TaskSet,
};
use tokio::sync::watch;

use crate::diff::ReferenceMap;
use crate::error::CacheError;
use crate::subscription::{fan_out, Delivery, Subscriber, Subscription, Translator};

/// Meta key naming the local object an entry was created from.
pub const META_KEY_SOURCE_NAME: &str = "k8s-name";
/// Meta key naming the datacenter whose controller owns an entry.
pub const META_KEY_DATACENTER: &str = "datacenter";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Kinds mirrored by the cache. Fixed for the cache's lifetime.
    pub kinds: Vec<Kind>,
    /// When set, only entries created for this datacenter are cached.
    pub datacenter: Option<String>,
    /// Kinds exempt from the datacenter ownership filter.
    pub unfiltered_kinds: Vec<Kind>,
    /// Query every namespace instead of the default one.
    pub namespaces_enabled: bool,
    /// Policy attached to namespaces created by [`ResourceCache::write`].
    pub cross_namespace_policy: Option<String>,
    pub partition: Option<String>,
    /// Long-poll duration of each blocking query.
    pub blocking_wait: Duration,
    /// Pause after a failed query. Zero retries immediately.
    pub retry_delay: Duration,
    pub delivery: Delivery,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            datacenter: None,
            unfiltered_kinds: Vec::new(),
            namespaces_enabled: false,
            cross_namespace_policy: None,
            partition: None,
            blocking_wait: DEFAULT_BLOCKING_WAIT,
            retry_delay: Duration::ZERO,
            delivery: Delivery::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_kinds<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Kind>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Index for the next blocking query. Never zero, since a zero index does not
/// block; an index that went backwards restarts from 1.
fn next_wait_index(previous: u64, last_index: u64) -> u64 {
    if last_index < previous {
        1
    } else {
        last_index.max(1)
    }
}

#[derive(Debug, Default)]
struct Snapshots {
    entries: HashMap<Kind, Arc<ReferenceMap<CatalogEntry>>>,
    services: Arc<ReferenceMap<CatalogService>>,
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<Kind, Vec<Subscriber<CatalogEntry>>>,
    services: Option<Subscriber<CatalogService>>,
}

/// In-memory mirror of the catalog for a fixed set of kinds.
pub struct ResourceCache {
    client: Arc<dyn CatalogClient>,
    config: CacheConfig,
    snapshots: Mutex<Snapshots>,
    registry: Mutex<Registry>,
    /// Number of topics that finished their first refresh.
    synced: watch::Sender<usize>,
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.config)
            .field("synced", &*self.synced.borrow())
            .finish_non_exhaustive()
    }
}

impl ResourceCache {
    pub fn new(client: Arc<dyn CatalogClient>, config: CacheConfig) -> Self {
        let mut snapshots = Snapshots::default();
        let mut registry = Registry::default();
        for kind in &config.kinds {
            snapshots.entries.insert(kind.clone(), Arc::default());
            registry.entries.insert(kind.clone(), Vec::new());
        }
        let (synced, _) = watch::channel(0);
        Self {
            client,
            config,
            snapshots: Mutex::new(snapshots),
            registry: Mutex::new(registry),
            synced,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn snapshots(&self) -> MutexGuard<'_, Snapshots> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn topic_count(&self) -> usize {
        self.config.kinds.len() + 1
    }

    // -----------------------------------------------------------------------
    // Refresh loops
    // -----------------------------------------------------------------------

    /// Refreshes every kind and the service topic until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut tasks = TaskSet::new("cache", &token);
        for kind in self.config.kinds.clone() {
            let cache = Arc::clone(&self);
            let task_token = tasks.token().clone();
            tasks.spawn(format!("cache-{kind}"), async move {
                cache.refresh_kind(kind, task_token).await;
            });
        }
        let cache = Arc::clone(&self);
        let task_token = tasks.token().clone();
        tasks.spawn(format!("cache-{}", Kind::SERVICES), async move {
            cache.refresh_services(task_token).await;
        });

        while let Some(outcome) = tasks.join_next().await {
            if let TaskOutcome::Panicked(name) = outcome {
                tracing::error!(task = %name, "cache refresh loop panicked");
            }
        }
        tracing::info!("resource cache stopped");
    }

    fn query_options(&self) -> QueryOptions {
        QueryOptions {
            wait_time: Some(self.config.blocking_wait),
            namespace: self
                .config
                .namespaces_enabled
                .then(|| QueryOptions::ALL_NAMESPACES.to_owned()),
            partition: self.config.partition.clone(),
            ..QueryOptions::default()
        }
    }

    async fn refresh_kind(&self, kind: Kind, token: CancellationToken) {
        let mut opts = self.query_options();
        let mut synced = false;
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = self.client.list_entries(&kind, &opts) => result,
            };
            let (entries, meta) = match result {
                Ok(listed) => listed,
                Err(err) => {
                    self.refresh_failed(kind.as_str(), &err);
                    if !self.pause(&token).await {
                        return;
                    }
                    continue;
                }
            };
            opts.wait_index = next_wait_index(opts.wait_index, meta.last_index);

            let changes = self.replace_entries(&kind, entries);
            if !synced {
                synced = true;
                self.mark_synced(kind.as_str());
            }
            self.notify_entries(&kind, &changes, &token).await;
        }
    }

    async fn refresh_services(&self, token: CancellationToken) {
        let mut opts = self.query_options();
        let mut synced = false;
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = self.client.list_services(&opts) => result,
            };
            let (services, meta) = match result {
                Ok(listed) => listed,
                Err(err) => {
                    self.refresh_failed(Kind::SERVICES, &err);
                    if !self.pause(&token).await {
                        return;
                    }
                    continue;
                }
            };
            opts.wait_index = next_wait_index(opts.wait_index, meta.last_index);

            let changes = self.replace_services(services);
            if !synced {
                synced = true;
                self.mark_synced(Kind::SERVICES);
            }
            self.notify_services(&changes, &token).await;
        }
    }

    fn refresh_failed(&self, topic: &str, err: &CatalogError) {
        metrics::counter!("catsync_cache_refresh_error_total", "kind" => topic.to_owned())
            .increment(1);
        if err.is_transient() {
            tracing::debug!(kind = topic, error = %err, "cache refresh interrupted");
        } else {
            tracing::warn!(kind = topic, error = %err, "cache refresh failed");
        }
    }

    /// Returns `false` when cancelled during the pause.
    async fn pause(&self, token: &CancellationToken) -> bool {
        if self.config.retry_delay.is_zero() {
            tokio::task::yield_now().await;
            return !token.is_cancelled();
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_delay) => true,
        }
    }

    fn mark_synced(&self, topic: &str) {
        tracing::info!(kind = topic, "sync mark");
        self.synced.send_modify(|count| *count += 1);
    }

    fn owned(&self, kind: &Kind, entry: &CatalogEntry) -> bool {
        let Some(datacenter) = &self.config.datacenter else {
            return true;
        };
        if self.config.unfiltered_kinds.contains(kind) {
            return true;
        }
        let named = entry
            .meta
            .get(META_KEY_SOURCE_NAME)
            .is_some_and(|name| !name.is_empty());
        named && entry.meta.get(META_KEY_DATACENTER) == Some(datacenter)
    }

    /// Swaps in the new map for `kind` and returns what changed.
    fn replace_entries(&self, kind: &Kind, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        let fresh: Arc<ReferenceMap<_>> = Arc::new(
            entries
                .into_iter()
                .filter(|entry| self.owned(kind, entry))
                .collect(),
        );
        let previous = self
            .snapshots()
            .entries
            .insert(kind.clone(), Arc::clone(&fresh))
            .unwrap_or_default();
        previous.diff(&fresh)
    }

    fn replace_services(&self, services: Vec<CatalogService>) -> Vec<CatalogService> {
        let fresh: Arc<ReferenceMap<_>> = Arc::new(services.into_iter().collect());
        let previous = std::mem::replace(&mut self.snapshots().services, Arc::clone(&fresh));
        previous.diff(&fresh)
    }

    async fn notify_entries(
        &self,
        kind: &Kind,
        changes: &[CatalogEntry],
        token: &CancellationToken,
    ) {
        if changes.is_empty() {
            return;
        }
        let subscribers = self
            .registry()
            .entries
            .get(kind)
            .cloned()
            .unwrap_or_default();
        if fan_out(kind.as_str(), &subscribers, changes, token).await {
            if let Some(live) = self.registry().entries.get_mut(kind) {
                live.retain(Subscriber::is_live);
            }
        }
    }

    async fn notify_services(&self, changes: &[CatalogService], token: &CancellationToken) {
        if changes.is_empty() {
            return;
        }
        let Some(subscriber) = self.registry().services.clone() else {
            return;
        };
        if fan_out(Kind::SERVICES, &[subscriber], changes, token).await {
            let mut registry = self.registry();
            if registry.services.as_ref().is_some_and(|s| !s.is_live()) {
                registry.services = None;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribes to changes of `kind`.
    pub fn subscribe<F>(&self, kind: &Kind, translator: F) -> Result<Subscription, CacheError>
    where
        F: Fn(&CatalogEntry) -> Vec<NamespacedName> + Send + Sync + 'static,
    {
        let translator: Translator<CatalogEntry> = Arc::new(translator);
        let mut registry = self.registry();
        let subscribers = registry
            .entries
            .get_mut(kind)
            .ok_or_else(|| CacheError::UnknownKind(kind.clone()))?;
        let (subscriber, subscription) = Subscriber::new(translator, self.config.delivery);
        subscribers.push(subscriber);
        tracing::debug!(kind = %kind, subscribers = subscribers.len(), "subscriber added");
        Ok(subscription)
    }

    /// Subscribes to service-instance changes. The topic takes one live
    /// subscriber at a time.
    pub fn subscribe_services<F>(&self, translator: F) -> Result<Subscription, CacheError>
    where
        F: Fn(&CatalogService) -> Vec<NamespacedName> + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        if registry.services.as_ref().is_some_and(Subscriber::is_live) {
            return Err(CacheError::DuplicateServiceSubscriber);
        }
        let translator: Translator<CatalogService> = Arc::new(translator);
        let (subscriber, subscription) = Subscriber::new(translator, self.config.delivery);
        registry.services = Some(subscriber);
        Ok(subscription)
    }

    /// Waits until every kind and the service topic completed their first
    /// refresh.
    pub async fn wait_synced(&self, token: &CancellationToken) -> Result<(), CacheError> {
        let expected = self.topic_count();
        let mut rx = self.synced.subscribe();
        tokio::select! {
            _ = token.cancelled() => Err(CacheError::Cancelled),
            synced = rx.wait_for(|count| *count >= expected) => match synced {
                Ok(_) => Ok(()),
                Err(_) => Err(CacheError::Cancelled),
            },
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow() >= self.topic_count()
    }

    /// `(topics synced, topics total)`.
    pub fn sync_progress(&self) -> (usize, usize) {
        (*self.synced.borrow(), self.topic_count())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, reference: &ResourceReference) -> Option<CatalogEntry> {
        self.snapshots()
            .entries
            .get(&reference.kind)?
            .get(reference)
            .cloned()
    }

    /// Cached entries of `kind`, ordered by reference. Empty for unknown kinds.
    pub fn list(&self, kind: &Kind) -> Vec<CatalogEntry> {
        let snapshot = self.snapshots().entries.get(kind).cloned();
        snapshot.map(|map| map.entries()).unwrap_or_default()
    }

    pub fn list_services(&self) -> Vec<CatalogService> {
        let snapshot = Arc::clone(&self.snapshots().services);
        snapshot.entries()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Compare-and-swap write keyed by `entry.modify_index`.
    ///
    /// Writing content identical to the cached entry is a no-op. A version
    /// mismatch fails with [`CacheError::StaleEntry`] and leaves both the
    /// catalog and the cache untouched. With namespaces enabled the version is
    /// checked before the namespace is ensured, so a stale write creates none.
    pub async fn write(&self, entry: &CatalogEntry) -> Result<(), CacheError> {
        let reference = &entry.reference;
        let cached = {
            let snapshots = self.snapshots();
            let map = snapshots
                .entries
                .get(&reference.kind)
                .ok_or_else(|| CacheError::UnknownKind(reference.kind.clone()))?;
            map.get(reference).cloned()
        };
        if let Some(cached) = cached {
            if cached.meta == entry.meta && cached.payload == entry.payload {
                return Ok(());
            }
        }

        if self.config.namespaces_enabled && !reference.namespace.is_empty() {
            let current = self.client.get_entry(reference).await?;
            if current.map_or(0, |e| e.modify_index) != entry.modify_index {
                return Err(self.stale(entry));
            }
            self.client
                .ensure_namespace(
                    &reference.namespace,
                    self.config.cross_namespace_policy.as_deref(),
                )
                .await?;
        }

        if !self.client.cas_entry(entry).await? {
            return Err(self.stale(entry));
        }
        Ok(())
    }

    fn stale(&self, entry: &CatalogEntry) -> CacheError {
        tracing::debug!(reference = %entry.reference, modify_index = entry.modify_index, "stale write rejected");
        CacheError::StaleEntry {
            reference: entry.reference.clone(),
            modify_index: entry.modify_index,
        }
    }

    /// Deletes a cached entry from the catalog. No-op if it is not cached.
    pub async fn delete(&self, reference: &ResourceReference) -> Result<(), CacheError> {
        if self.get(reference).is_none() {
            return Ok(());
        }
        self.client.delete_entry(reference).await?;
        Ok(())
    }
}
