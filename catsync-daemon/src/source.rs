//! Desired-state feed.
//!
//! Any producer can push snapshots through the runtime's source sender. The
//! daemon also ships a file source that re-reads a YAML list of
//! registrations and forwards it whenever the content changes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use catsync_core::{CancellationToken, CatalogRegistration};
use thiserror::Error;
use tokio::sync::mpsc;

/// One message from a source: a complete snapshot, or why none could be
/// produced.
pub type SourceUpdate = Result<Vec<CatalogRegistration>, SourceError>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("registrations file not found at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Blank content. An empty snapshot must be written as `[]`.
    #[error("registrations file {path} is empty")]
    Empty { path: PathBuf },

    /// Reported by an external producer.
    #[error("source failed: {0}")]
    Upstream(String),
}

/// Read a YAML list of registrations.
///
/// A blank file is [`SourceError::Empty`]; an empty snapshot is written as
/// `[]`.
pub fn load_registrations_at(path: &Path) -> Result<Vec<CatalogRegistration>, SourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            SourceError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            SourceError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    if content.trim().is_empty() {
        return Err(SourceError::Empty {
            path: path.to_path_buf(),
        });
    }
    serde_yaml::from_str(&content).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Polls `path` every `period` and forwards changed snapshots.
///
/// Errors are forwarded every time they occur. A snapshot equal to the last
/// forwarded one is skipped.
pub async fn poll_file(
    path: PathBuf,
    period: Duration,
    updates: mpsc::Sender<SourceUpdate>,
    token: CancellationToken,
) {
    tracing::info!(path = %path.display(), period_ms = period.as_millis() as u64, "file source started");
    let mut last: Option<Vec<CatalogRegistration>> = None;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let update = match load_registrations_at(&path) {
            Ok(registrations) if last.as_ref() == Some(&registrations) => continue,
            Ok(registrations) => {
                last = Some(registrations.clone());
                Ok(registrations)
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to load registrations");
                Err(err)
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            sent = updates.send(update) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!(path = %path.display(), "file source stopped");
}
