//! The catalog reconciliation engine.
//!
//! [`CatalogSyncer::sync`] swaps in a new desired snapshot. [`CatalogSyncer::run`]
//! then drives three kinds of work against the catalog:
//!
//! 1. a periodic full pass that drains scheduled deregistrations and
//!    re-registers every desired instance,
//! 2. a reaper that finds instances this node owns but no longer wants,
//!    gated on the first `sync`,
//! 3. one watcher per desired service that looks for drift.
//!
//! The reaper and the watchers only schedule deregistrations; the full pass
//! is the only place that writes to the catalog.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use catsync_core::memory::DEFAULT_BLOCKING_WAIT;
use catsync_core::{
    CancellationToken, CatalogClient, CatalogDeregistration, CatalogError, CatalogRegistration,
    CatalogService, QueryOptions, ShutdownReport, TaskOutcome, TaskSet,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::backoff::Backoff;
use crate::desired::{namespace_key, DesiredServiceSet, SyncDelta};
use crate::error::SyncError;
use crate::metrics;

pub const DEFAULT_NODE_NAME: &str = "k8s-sync";
pub const DEFAULT_OWNERSHIP_TAG: &str = "k8s";
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_SERVICE_POLL_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Synthetic node every instance is registered under.
    pub node_name: String,
    /// Tag carried by every instance this syncer registers.
    pub ownership_tag: String,
    pub enable_namespaces: bool,
    /// Policy attached to namespaces the syncer creates.
    pub cross_namespace_policy: Option<String>,
    /// Interval between full reconciliation passes.
    pub sync_period: Duration,
    /// Interval between two reads of one watched service.
    pub service_poll_period: Duration,
    /// Pause between two reaper queries.
    pub reaper_min_wait: Duration,
    /// Long-poll duration of the reaper query.
    pub blocking_wait: Duration,
    pub backoff: Backoff,
    pub shutdown_grace: Duration,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            node_name: DEFAULT_NODE_NAME.to_owned(),
            ownership_tag: DEFAULT_OWNERSHIP_TAG.to_owned(),
            enable_namespaces: false,
            cross_namespace_policy: None,
            sync_period: DEFAULT_SYNC_PERIOD,
            service_poll_period: DEFAULT_SERVICE_POLL_PERIOD,
            reaper_min_wait: DEFAULT_SYNC_PERIOD / 4,
            blocking_wait: DEFAULT_BLOCKING_WAIT,
            backoff: Backoff::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one full reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub deregistered: usize,
    pub deregister_failed: usize,
    /// Scheduled deregistrations dropped because the instance is desired again.
    pub deregister_skipped: usize,
    pub registered: usize,
    pub register_failed: usize,
    pub namespaces_created: usize,
    /// Registrations skipped because their namespace could not be ensured.
    pub namespace_failed: usize,
}

/// Point-in-time view of the syncer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub initial_sync_done: bool,
    pub desired_instances: usize,
    pub desired_services: usize,
    /// Watched services as `namespace/service`.
    pub watched_services: Vec<String>,
    /// Instance ids scheduled for deregistration.
    pub pending_deregistrations: Vec<String>,
    pub reconcile_passes: u64,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Syncer
// ---------------------------------------------------------------------------

type WatchKey = (String, String);

#[derive(Debug, Default)]
struct SyncState {
    desired: Arc<DesiredServiceSet>,
    /// Keyed by instance id.
    pending: HashMap<String, CatalogDeregistration>,
    watchers: HashMap<WatchKey, CancellationToken>,
    reconcile_passes: u64,
    last_reconciled_at: Option<DateTime<Utc>>,
}

pub struct CatalogSyncer {
    client: Arc<dyn CatalogClient>,
    config: SyncerConfig,
    state: Mutex<SyncState>,
    initial_sync: watch::Sender<bool>,
    wake: Notify,
}

impl std::fmt::Debug for CatalogSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogSyncer")
            .field("config", &self.config)
            .field("initial_sync", &*self.initial_sync.borrow())
            .finish_non_exhaustive()
    }
}

fn watcher_name((namespace, service): &WatchKey) -> String {
    format!("watch:{namespace}/{service}")
}

async fn guarded<T, F>(
    token: &CancellationToken,
    call: F,
) -> Result<Result<T, CatalogError>, SyncError>
where
    F: Future<Output = Result<T, CatalogError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SyncError::Cancelled),
        result = call => Ok(result),
    }
}

impl CatalogSyncer {
    pub fn new(client: Arc<dyn CatalogClient>, config: SyncerConfig) -> Self {
        let (initial_sync, _) = watch::channel(false);
        Self {
            client,
            config,
            state: Mutex::new(SyncState::default()),
            initial_sync,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn namespace_key<'a>(&self, namespace: &'a str) -> &'a str {
        namespace_key(namespace, self.config.enable_namespaces)
    }

    // -----------------------------------------------------------------------
    // Desired state
    // -----------------------------------------------------------------------

    /// Replaces the desired snapshot.
    ///
    /// Instances that left the snapshot and are registered on this node are
    /// scheduled for deregistration right away, and a non-empty change wakes
    /// the reconcile loop. The first call opens the reaper gate.
    pub fn sync(&self, registrations: Vec<CatalogRegistration>) -> SyncDelta {
        let next =
            DesiredServiceSet::from_registrations(registrations, self.config.enable_namespaces);
        let delta = {
            let mut state = self.lock();
            let delta = state.desired.delta(&next);
            for removed in &delta.removed {
                if removed.node != self.config.node_name {
                    continue;
                }
                tracing::info!(
                    service = %removed.service.service,
                    service_id = %removed.service.id,
                    namespace = %removed.service.namespace,
                    "service instance removed from source, scheduling deregistration",
                );
                state
                    .pending
                    .insert(removed.service.id.clone(), removed.deregistration());
            }
            state.desired = Arc::new(next);
            delta
        };

        if !delta.is_empty() {
            tracing::debug!(
                upserted = delta.upserted.len(),
                removed = delta.removed.len(),
                "desired state changed",
            );
            self.wake.notify_one();
        }

        let opened = self.initial_sync.send_if_modified(|done| !std::mem::replace(done, true));
        if opened {
            tracing::info!("initial sync received, reaper enabled");
        }
        delta
    }

    pub fn desired(&self) -> Arc<DesiredServiceSet> {
        Arc::clone(&self.lock().desired)
    }

    pub fn initial_sync_done(&self) -> bool {
        *self.initial_sync.borrow()
    }

    /// Scheduled deregistrations, ordered by instance id.
    pub fn pending(&self) -> Vec<CatalogDeregistration> {
        let state = self.lock();
        let ordered: BTreeMap<_, _> = state.pending.iter().collect();
        ordered.into_values().cloned().collect()
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.lock();
        let mut watched_services: Vec<String> = state
            .watchers
            .keys()
            .map(|(namespace, service)| format!("{namespace}/{service}"))
            .collect();
        watched_services.sort();
        let mut pending_deregistrations: Vec<String> = state.pending.keys().cloned().collect();
        pending_deregistrations.sort();
        SyncStatus {
            initial_sync_done: *self.initial_sync.borrow(),
            desired_instances: state.desired.len(),
            desired_services: state.desired.service_count(),
            watched_services,
            pending_deregistrations,
            reconcile_passes: state.reconcile_passes,
            last_reconciled_at: state.last_reconciled_at,
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Schedules every instance this node owns that is not desired anymore.
    /// Returns how many were newly scheduled.
    fn schedule_undesired<'a, I>(&self, instances: I) -> usize
    where
        I: IntoIterator<Item = &'a CatalogService>,
    {
        let mut state = self.lock();
        let desired = Arc::clone(&state.desired);
        let mut scheduled = 0;
        for instance in instances {
            if instance.node != self.config.node_name
                || !instance.has_tag(&self.config.ownership_tag)
            {
                continue;
            }
            let namespace = self.namespace_key(&instance.namespace);
            if desired.contains_instance(namespace, &instance.service_name, &instance.service_id) {
                continue;
            }
            let dereg = CatalogDeregistration::from(instance);
            if state
                .pending
                .insert(instance.service_id.clone(), dereg)
                .is_none()
            {
                scheduled += 1;
                tracing::info!(
                    service = %instance.service_name,
                    service_id = %instance.service_id,
                    namespace = %instance.namespace,
                    "invalid service instance found, scheduling for deregistration",
                );
            }
        }
        scheduled
    }

    // -----------------------------------------------------------------------
    // Full reconciliation
    // -----------------------------------------------------------------------

    /// One full pass: drain scheduled deregistrations, then register every
    /// desired instance.
    ///
    /// The scheduled set is cleared whatever the outcome of each call; the
    /// reaper and the watchers find failed deregistrations again.
    pub async fn reconcile_once(
        &self,
        token: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let (desired, pending) = {
            let mut state = self.lock();
            (Arc::clone(&state.desired), std::mem::take(&mut state.pending))
        };
        let mut report = ReconcileReport::default();

        let ordered: BTreeMap<_, _> = pending.into_iter().collect();
        for dereg in ordered.into_values() {
            let namespace = self.namespace_key(&dereg.namespace);
            let wanted_again = desired
                .get(namespace, &dereg.service_id)
                .is_some_and(|reg| reg.node == dereg.node);
            if wanted_again {
                report.deregister_skipped += 1;
                tracing::debug!(service_id = %dereg.service_id, "instance desired again, skipping deregistration");
                continue;
            }

            tracing::info!(
                node = %dereg.node,
                service_id = %dereg.service_id,
                namespace = %dereg.namespace,
                "deregistering service",
            );
            match guarded(token, self.client.deregister(&dereg)).await? {
                Ok(()) => {
                    report.deregistered += 1;
                    metrics::deregistered(&dereg);
                }
                Err(err) => {
                    report.deregister_failed += 1;
                    metrics::deregister_failed();
                    tracing::warn!(
                        node = %dereg.node,
                        service_id = %dereg.service_id,
                        namespace = %dereg.namespace,
                        error = %err,
                        "error deregistering service",
                    );
                }
            }
        }

        let mut ensured: HashSet<&str> = HashSet::new();
        let mut unavailable: HashSet<&str> = HashSet::new();
        for registration in desired.registrations() {
            let namespace = registration.service.namespace.as_str();
            if self.config.enable_namespaces && !namespace.is_empty() {
                if unavailable.contains(namespace) {
                    report.namespace_failed += 1;
                    continue;
                }
                if !ensured.contains(namespace) {
                    let policy = self.config.cross_namespace_policy.as_deref();
                    match guarded(token, self.client.ensure_namespace(namespace, policy)).await? {
                        Ok(created) => {
                            if created {
                                report.namespaces_created += 1;
                                tracing::info!(namespace, "created catalog namespace");
                            }
                            ensured.insert(namespace);
                        }
                        Err(err) => {
                            report.namespace_failed += 1;
                            unavailable.insert(namespace);
                            tracing::warn!(
                                namespace,
                                service = %registration.service.service,
                                error = %err,
                                "error checking and creating catalog namespace",
                            );
                            continue;
                        }
                    }
                }
            }

            match guarded(token, self.client.register(registration)).await? {
                Ok(()) => {
                    report.registered += 1;
                    metrics::registered(registration);
                    tracing::debug!(
                        node = %registration.node,
                        service = %registration.service.service,
                        service_id = %registration.service.id,
                        namespace,
                        "registered service instance",
                    );
                }
                Err(err) => {
                    report.register_failed += 1;
                    metrics::register_failed();
                    tracing::warn!(
                        node = %registration.node,
                        service = %registration.service.service,
                        namespace,
                        error = %err,
                        "error registering service",
                    );
                }
            }
        }

        let mut state = self.lock();
        state.reconcile_passes += 1;
        state.last_reconciled_at = Some(Utc::now());
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Reaper
    // -----------------------------------------------------------------------

    fn reaper_options(&self, wait_index: u64) -> QueryOptions {
        QueryOptions {
            wait_index,
            wait_time: Some(self.config.blocking_wait),
            namespace: self
                .config
                .enable_namespaces
                .then(|| QueryOptions::ALL_NAMESPACES.to_owned()),
            tag: Some(self.config.ownership_tag.clone()),
            allow_stale: true,
            ..QueryOptions::default()
        }
    }

    async fn reap_pass(
        &self,
        wait_index: u64,
        token: &CancellationToken,
    ) -> Result<(usize, u64), SyncError> {
        let opts = self.reaper_options(wait_index);
        let client = &self.client;
        let node = self.config.node_name.as_str();
        let opts = &opts;
        let (instances, meta) = self
            .config
            .backoff
            .retry("node services", token, move || client.node_services(node, opts))
            .await?;
        Ok((self.schedule_undesired(&instances), meta.last_index))
    }

    /// A single non-blocking reaper query. Does nothing until the first
    /// `sync`. Returns how many instances were newly scheduled.
    pub async fn reap_once(&self, token: &CancellationToken) -> Result<usize, SyncError> {
        if !self.initial_sync_done() {
            tracing::debug!("reaper skipped, no initial sync yet");
            return Ok(0);
        }
        let (scheduled, _) = self.reap_pass(0, token).await?;
        Ok(scheduled)
    }

    async fn reap_loop(self: Arc<Self>, token: CancellationToken) {
        let mut gate = self.initial_sync.subscribe();
        let opened = tokio::select! {
            _ = token.cancelled() => false,
            opened = gate.wait_for(|done| *done) => opened.is_ok(),
        };
        if !opened {
            return;
        }
        tracing::info!(node = %self.config.node_name, "reaper started");

        let mut wait_index = 0;
        loop {
            match self.reap_pass(wait_index, &token).await {
                Ok((scheduled, last_index)) => {
                    wait_index = if last_index < wait_index { 0 } else { last_index };
                    if scheduled > 0 {
                        self.wake.notify_one();
                    }
                }
                Err(SyncError::Cancelled) => break,
                Err(err) => {
                    wait_index = 0;
                    tracing::warn!(error = %err, "reaper query failed");
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.reaper_min_wait) => {}
            }
        }
        tracing::info!("reaper stopped");
    }

    // -----------------------------------------------------------------------
    // Watchers
    // -----------------------------------------------------------------------

    async fn watch_service(
        self: Arc<Self>,
        namespace: String,
        service: String,
        token: CancellationToken,
    ) {
        tracing::info!(%service, %namespace, "starting service watcher");
        let opts = QueryOptions {
            namespace: self.config.enable_namespaces.then(|| namespace.clone()),
            tag: Some(self.config.ownership_tag.clone()),
            allow_stale: true,
            ..QueryOptions::default()
        };
        loop {
            let client = &self.client;
            let name = service.as_str();
            let query = &opts;
            let result = self
                .config
                .backoff
                .retry("service instances", &token, move || {
                    client.service_instances(name, query)
                })
                .await;
            match result {
                Ok((instances, _)) => {
                    self.schedule_undesired(&instances);
                }
                Err(SyncError::Cancelled) => break,
                Err(err) => {
                    tracing::warn!(%service, %namespace, error = %err, "service watcher query failed");
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.service_poll_period) => {}
            }
        }
        tracing::info!(%service, %namespace, "stopping service watcher");
    }

    /// Stops watchers of services that left the snapshot and starts one for
    /// every desired service without a watcher.
    fn update_watchers(self: &Arc<Self>, watchers: &mut TaskSet) {
        let started: Vec<(WatchKey, CancellationToken)> = {
            let mut state = self.lock();
            let desired = Arc::clone(&state.desired);
            state.watchers.retain(|(namespace, service), token| {
                let keep = desired.contains_service(namespace, service);
                if !keep {
                    tracing::debug!(%namespace, %service, "cancelling service watcher");
                    token.cancel();
                }
                keep
            });
            let missing: Vec<WatchKey> = desired
                .services()
                .filter(|(namespace, service)| {
                    !state
                        .watchers
                        .contains_key(&(namespace.to_string(), service.to_string()))
                })
                .map(|(namespace, service)| (namespace.to_owned(), service.to_owned()))
                .collect();
            missing
                .into_iter()
                .map(|key| {
                    let token = watchers.token().child_token();
                    state.watchers.insert(key.clone(), token.clone());
                    (key, token)
                })
                .collect()
        };

        for (key, token) in started {
            let name = watcher_name(&key);
            let (namespace, service) = key;
            watchers.spawn(
                name,
                Arc::clone(self).watch_service(namespace, service, token),
            );
        }
    }

    /// Forgets watchers that panicked so the next pass restarts them.
    fn collect_finished_watchers(&self, watchers: &mut TaskSet) {
        for outcome in watchers.reap_finished() {
            let TaskOutcome::Panicked(name) = outcome else {
                continue;
            };
            tracing::error!(task = %name, "service watcher panicked, restarting next pass");
            self.lock().watchers.retain(|key, _| watcher_name(key) != name);
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Reconciles until `token` is cancelled, then shuts down the reaper and
    /// every watcher.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> ShutdownReport {
        let mut tasks = TaskSet::new("syncer", &token);
        let reaper_token = tasks.token().clone();
        tasks.spawn("reaper", Arc::clone(&self).reap_loop(reaper_token));
        let mut watchers = TaskSet::new("watchers", tasks.token());

        let mut ticker = tokio::time::interval(self.config.sync_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            self.collect_finished_watchers(&mut watchers);
            self.update_watchers(&mut watchers);
            tracing::info!("registering services");
            match self.reconcile_once(&token).await {
                Ok(report) => tracing::debug!(?report, "reconciliation pass finished"),
                Err(SyncError::Cancelled) => break,
                Err(err) => tracing::warn!(error = %err, "reconciliation pass failed"),
            }
        }

        tracing::info!("catalog syncer quitting");
        let mut report = watchers.shutdown(self.config.shutdown_grace).await;
        report.absorb(tasks.shutdown(self.config.shutdown_grace).await);
        self.lock().watchers.clear();
        report
    }
}
