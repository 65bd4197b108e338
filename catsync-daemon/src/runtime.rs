use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use catsync_cache::ResourceCache;
use catsync_core::{CancellationToken, CatalogClient, ShutdownReport, TaskSet};
use catsync_sync::{metrics, CatalogSyncer, SyncStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{io_err, DaemonError};
use crate::settings::Settings;
use crate::source::{self, SourceUpdate};

/// Snapshots buffered between producers and the syncer.
const SOURCE_CHANNEL_CAPACITY: usize = 16;

/// Counters for the desired-state feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub accepted: u64,
    pub rejected: u64,
    pub last_error: Option<String>,
    pub last_accepted_at: Option<DateTime<Utc>>,
}

/// What `status` reports for a running daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub cache_synced: bool,
    pub cache_topics_synced: usize,
    pub cache_topics_total: usize,
    pub syncer: SyncStatus,
    pub source: SourceStats,
}

/// Handle to a started daemon. Dropping it without calling
/// [`RuntimeHandle::shutdown`] cancels every task without waiting.
pub struct RuntimeHandle {
    settings: Settings,
    cache: Arc<ResourceCache>,
    syncer: Arc<CatalogSyncer>,
    source_tx: mpsc::Sender<SourceUpdate>,
    tasks: TaskSet,
    nested: Arc<Mutex<ShutdownReport>>,
    stats: Arc<Mutex<SourceStats>>,
    started_at: DateTime<Utc>,
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.tasks.token().cancel();
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Validate `settings` and spawn the cache, the syncer and the source feed.
///
/// Must be called from within a Tokio runtime.
pub fn start(
    settings: Settings,
    client: Arc<dyn CatalogClient>,
) -> Result<RuntimeHandle, DaemonError> {
    settings.validate()?;
    metrics::describe();

    let cache = Arc::new(ResourceCache::new(client.clone(), settings.cache_config()));
    let syncer = Arc::new(CatalogSyncer::new(client, settings.syncer_config()));
    let (source_tx, source_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
    let nested = Arc::new(Mutex::new(ShutdownReport::default()));
    let stats = Arc::new(Mutex::new(SourceStats::default()));

    let root = CancellationToken::new();
    let mut tasks = TaskSet::new("daemon", &root);

    tasks.spawn("cache", cache.clone().run(tasks.token().clone()));

    {
        let syncer = syncer.clone();
        let nested = nested.clone();
        let token = tasks.token().clone();
        tasks.spawn("syncer", async move {
            let report = syncer.run(token).await;
            lock(&nested).absorb(report);
        });
    }

    tasks.spawn(
        "source-feed",
        forward_updates(
            syncer.clone(),
            source_rx,
            stats.clone(),
            tasks.token().clone(),
        ),
    );

    if let Some(path) = settings.registrations_file.clone() {
        tasks.spawn(
            "file-source",
            source::poll_file(
                path,
                settings.source_poll_period(),
                source_tx.clone(),
                tasks.token().clone(),
            ),
        );
    }

    tracing::info!(
        node = %settings.node_name,
        kinds = settings.kinds.len(),
        namespaces = settings.enable_namespaces,
        "daemon started",
    );

    Ok(RuntimeHandle {
        settings,
        cache,
        syncer,
        source_tx,
        tasks,
        nested,
        stats,
        started_at: Utc::now(),
    })
}

/// Build a multi-thread runtime, start the daemon and block until Ctrl-C.
pub fn start_blocking(
    settings: Settings,
    client: Arc<dyn CatalogClient>,
) -> Result<ShutdownReport, DaemonError> {
    init_tracing(&settings.log_level, settings.log_json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async move { start(settings, client)?.run_until_signal().await })
}

/// Feeds source snapshots to the syncer. Only `Ok` snapshots reach `sync`,
/// so a failing source never opens the reaper gate.
async fn forward_updates(
    syncer: Arc<CatalogSyncer>,
    mut updates: mpsc::Receiver<SourceUpdate>,
    stats: Arc<Mutex<SourceStats>>,
    token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = token.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };
        match update {
            Ok(registrations) => {
                let count = registrations.len();
                let delta = syncer.sync(registrations);
                tracing::debug!(
                    registrations = count,
                    upserted = delta.upserted.len(),
                    removed = delta.removed.len(),
                    "source snapshot applied",
                );
                let mut stats = lock(&stats);
                stats.accepted += 1;
                stats.last_accepted_at = Some(Utc::now());
            }
            Err(err) => {
                tracing::warn!(error = %err, "source update rejected");
                let mut stats = lock(&stats);
                stats.rejected += 1;
                stats.last_error = Some(err.to_string());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuntimeHandle {
    /// Sender for external producers of desired state.
    pub fn source_sender(&self) -> mpsc::Sender<SourceUpdate> {
        self.source_tx.clone()
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn syncer(&self) -> &Arc<CatalogSyncer> {
        &self.syncer
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> DaemonStatus {
        let (synced, total) = self.cache.sync_progress();
        DaemonStatus {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            cache_synced: self.cache.is_synced(),
            cache_topics_synced: synced,
            cache_topics_total: total,
            syncer: self.syncer.status(),
            source: lock(&self.stats).clone(),
        }
    }

    pub fn status_json(&self) -> Result<String, DaemonError> {
        Ok(serde_json::to_string_pretty(&self.status())?)
    }

    /// Wait until every cache topic has completed its first refresh.
    pub async fn wait_cache_synced(&self) -> Result<(), DaemonError> {
        self.cache.wait_synced(self.tasks.token()).await?;
        Ok(())
    }

    /// Cancel every task and wait up to the configured grace period.
    pub async fn shutdown(mut self) -> ShutdownReport {
        tracing::info!("daemon shutting down");
        let grace = self.settings.shutdown_grace();
        let tasks = std::mem::replace(
            &mut self.tasks,
            TaskSet::new("daemon", &CancellationToken::new()),
        );
        let mut report = tasks.shutdown(grace).await;
        report.absorb(std::mem::take(&mut *lock(&self.nested)));
        if !report.is_clean() {
            tracing::warn!(
                panicked = ?report.panicked,
                aborted = ?report.aborted,
                "daemon shut down with unfinished tasks",
            );
        }
        report
    }

    /// Run until Ctrl-C, then shut down.
    pub async fn run_until_signal(self) -> Result<ShutdownReport, DaemonError> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| DaemonError::Signal(e.to_string()))?;
        tracing::info!("shutdown signal received");
        Ok(self.shutdown().await)
    }
}
