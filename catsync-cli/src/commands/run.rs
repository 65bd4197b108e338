//! `catsync run`: the daemon against an in-process catalog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use catsync_core::CatalogClient;

use super::{load_settings, seeded_catalog};

/// Arguments for `catsync run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Settings file (YAML).
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Registrations loaded into the catalog before start.
    #[arg(long)]
    pub existing: Option<PathBuf>,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let settings = load_settings(self.settings.as_deref())?;

        let seeding = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("failed to build runtime")?;
        let catalog = seeding.block_on(seeded_catalog(self.existing.as_deref()))?;
        drop(seeding);

        let client: Arc<dyn CatalogClient> = catalog;
        let report = catsync_daemon::start_blocking(settings, client)
            .context("daemon exited with error")?;
        if report.is_clean() {
            println!("{} {} tasks stopped", "shutdown:".green().bold(), report.total());
        } else {
            println!(
                "{} panicked {:?}, aborted {:?}",
                "shutdown:".yellow().bold(),
                report.panicked,
                report.aborted,
            );
        }
        Ok(())
    }
}
