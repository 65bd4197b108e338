pub mod check;
pub mod plan;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use catsync_core::{CatalogClient, MemoryCatalog};
use catsync_daemon::{load_at, load_registrations_at, Settings};

/// Settings from `path`, or the defaults when no path is given.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => {
            load_at(path).with_context(|| format!("failed to load settings from {}", path.display()))
        }
        None => Ok(Settings::default()),
    }
}

/// An in-process catalog holding the registrations listed in `existing`.
pub async fn seeded_catalog(existing: Option<&Path>) -> Result<Arc<MemoryCatalog>> {
    let catalog = Arc::new(MemoryCatalog::new());
    let Some(path) = existing else {
        return Ok(catalog);
    };
    let registrations = load_registrations_at(path)
        .with_context(|| format!("failed to load existing registrations from {}", path.display()))?;
    for registration in &registrations {
        catalog
            .register(registration)
            .await
            .with_context(|| format!("failed to seed '{}'", registration.service.id))?;
    }
    catalog.clear_ops();
    Ok(catalog)
}
