use std::path::PathBuf;

use thiserror::Error;

/// Error surface for settings, the source feed and the runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed YAML, with the offending file.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("settings not found at {path}")]
    SettingsNotFound { path: PathBuf },

    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("cache error: {0}")]
    Cache(#[from] catsync_cache::CacheError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signal handler failed: {0}")]
    Signal(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
