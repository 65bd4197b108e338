//! Daemon settings, loaded from a YAML file.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are plain millisecond counts to keep the file format flat.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use catsync_cache::{CacheConfig, Delivery};
use catsync_core::Kind;
use catsync_sync::syncer::{DEFAULT_NODE_NAME, DEFAULT_OWNERSHIP_TAG};
use catsync_sync::SyncerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};

/// Kinds mirrored when the settings name none.
pub const DEFAULT_KINDS: &[&str] = &[
    "api-gateway",
    "http-route",
    "tcp-route",
    "inline-certificate",
    "jwt-provider",
];

/// Kinds shared across datacenters and therefore never ownership-filtered.
pub const DEFAULT_UNFILTERED_KINDS: &[&str] = &["jwt-provider"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node_name: String,
    pub ownership_tag: String,
    pub datacenter: Option<String>,
    pub enable_namespaces: bool,
    pub cross_namespace_acl_policy: Option<String>,
    pub partition: Option<String>,

    pub sync_period_ms: u64,
    pub service_poll_period_ms: u64,
    pub reaper_min_wait_ms: u64,
    pub blocking_wait_ms: u64,
    /// Pause after a failed cache refresh. Zero retries immediately.
    pub cache_retry_delay_ms: u64,

    pub kinds: Vec<String>,
    pub unfiltered_kinds: Vec<String>,
    pub delivery: Delivery,

    /// YAML list of registrations polled as the desired-state source.
    pub registrations_file: Option<PathBuf>,
    pub source_poll_period_ms: u64,

    pub log_level: String,
    pub log_json: bool,
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: DEFAULT_NODE_NAME.to_owned(),
            ownership_tag: DEFAULT_OWNERSHIP_TAG.to_owned(),
            datacenter: None,
            enable_namespaces: false,
            cross_namespace_acl_policy: None,
            partition: None,
            sync_period_ms: 2_000,
            service_poll_period_ms: 60_000,
            reaper_min_wait_ms: 500,
            blocking_wait_ms: 300_000,
            cache_retry_delay_ms: 0,
            kinds: DEFAULT_KINDS.iter().map(|k| (*k).to_owned()).collect(),
            unfiltered_kinds: DEFAULT_UNFILTERED_KINDS
                .iter()
                .map(|k| (*k).to_owned())
                .collect(),
            delivery: Delivery::default(),
            registrations_file: None,
            source_poll_period_ms: 5_000,
            log_level: "info".to_owned(),
            log_json: false,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Load settings from `path`.
///
/// A missing file is an error; an empty one yields the defaults.
pub fn load_at(path: &Path) -> Result<Settings, DaemonError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(DaemonError::SettingsNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(io_err(path, err)),
    };
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(&content).map_err(|source| DaemonError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Settings {
    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), DaemonError> {
        let mut problems = Vec::new();

        if self.node_name.trim().is_empty() {
            problems.push("node_name must not be empty".to_owned());
        }
        if self.ownership_tag.trim().is_empty() {
            problems.push("ownership_tag must not be empty".to_owned());
        }
        for (field, value) in [
            ("sync_period_ms", self.sync_period_ms),
            ("service_poll_period_ms", self.service_poll_period_ms),
            ("blocking_wait_ms", self.blocking_wait_ms),
            ("source_poll_period_ms", self.source_poll_period_ms),
        ] {
            if value == 0 {
                problems.push(format!("{field} must be greater than zero"));
            }
        }
        if let Delivery::Bounded { capacity: 0 } = self.delivery {
            problems.push("delivery capacity must be greater than zero".to_owned());
        }
        for kind in &self.kinds {
            if kind.trim().is_empty() {
                problems.push("kinds must not contain an empty name".to_owned());
            } else if kind == Kind::SERVICES {
                problems.push(format!("kind `{kind}` is reserved for service instances"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DaemonError::Invalid(problems))
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            kinds: self.kinds.iter().map(|k| Kind::from(k.as_str())).collect(),
            datacenter: self.datacenter.clone(),
            unfiltered_kinds: self
                .unfiltered_kinds
                .iter()
                .map(|k| Kind::from(k.as_str()))
                .collect(),
            namespaces_enabled: self.enable_namespaces,
            cross_namespace_policy: self.cross_namespace_acl_policy.clone(),
            partition: self.partition.clone(),
            blocking_wait: Duration::from_millis(self.blocking_wait_ms),
            retry_delay: Duration::from_millis(self.cache_retry_delay_ms),
            delivery: self.delivery,
        }
    }

    pub fn syncer_config(&self) -> SyncerConfig {
        SyncerConfig {
            node_name: self.node_name.clone(),
            ownership_tag: self.ownership_tag.clone(),
            enable_namespaces: self.enable_namespaces,
            cross_namespace_policy: self.cross_namespace_acl_policy.clone(),
            sync_period: Duration::from_millis(self.sync_period_ms),
            service_poll_period: Duration::from_millis(self.service_poll_period_ms),
            reaper_min_wait: Duration::from_millis(self.reaper_min_wait_ms),
            blocking_wait: Duration::from_millis(self.blocking_wait_ms),
            shutdown_grace: self.shutdown_grace(),
            ..SyncerConfig::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn source_poll_period(&self) -> Duration {
        Duration::from_millis(self.source_poll_period_ms)
    }
}
