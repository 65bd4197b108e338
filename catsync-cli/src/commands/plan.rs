//! `catsync plan`: offline dry run of one reconciliation pass.
//!
//! The existing registrations are loaded into an in-process catalog, the
//! desired set is synced, the reaper runs once and a single full pass is
//! made. Every catalog call of that pass is printed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use catsync_core::{CancellationToken, CatalogClient, CatalogOp};
use catsync_daemon::load_registrations_at;
use catsync_sync::{CatalogSyncer, ReconcileReport};

use super::{load_settings, seeded_catalog};

/// Arguments for `catsync plan`.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Desired registrations (YAML or JSON list).
    #[arg(long)]
    pub desired: PathBuf,

    /// Registrations already present in the catalog.
    #[arg(long)]
    pub existing: Option<PathBuf>,

    /// Settings file (YAML).
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct PlannedCall {
    #[tabled(rename = "action")]
    action: &'static str,
    #[tabled(rename = "target")]
    target: String,
    #[tabled(rename = "node")]
    node: String,
}

#[derive(Serialize)]
struct PlanJson {
    scheduled_by_reaper: usize,
    report: ReconcileReport,
    calls: Vec<PlannedCall>,
}

impl PlanArgs {
    pub fn run(self) -> Result<()> {
        let settings = load_settings(self.settings.as_deref())?;
        settings.validate()?;
        let desired = load_registrations_at(&self.desired).with_context(|| {
            format!(
                "failed to load desired registrations from {}",
                self.desired.display()
            )
        })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build runtime")?;

        let (scheduled, report, ops) = runtime.block_on(async {
            let catalog = seeded_catalog(self.existing.as_deref()).await?;
            let client: Arc<dyn CatalogClient> = catalog.clone();
            let syncer = CatalogSyncer::new(client, settings.syncer_config());
            let token = CancellationToken::new();

            syncer.sync(desired);
            let scheduled = syncer
                .reap_once(&token)
                .await
                .context("reaper query failed")?;
            let report = syncer
                .reconcile_once(&token)
                .await
                .context("reconciliation pass failed")?;
            anyhow::Ok((scheduled, report, catalog.ops()))
        })?;

        let calls: Vec<PlannedCall> = ops.into_iter().filter_map(planned_call).collect();
        if self.json {
            let payload = PlanJson {
                scheduled_by_reaper: scheduled,
                report,
                calls,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize plan")?
            );
            return Ok(());
        }

        print_plan(scheduled, &report, calls);
        Ok(())
    }
}

fn planned_call(op: CatalogOp) -> Option<PlannedCall> {
    match op {
        CatalogOp::Register { node, service_id } => Some(PlannedCall {
            action: "register",
            target: service_id,
            node,
        }),
        CatalogOp::Deregister { node, service_id } => Some(PlannedCall {
            action: "deregister",
            target: service_id,
            node,
        }),
        CatalogOp::NamespaceCreated { namespace } => Some(PlannedCall {
            action: "create-namespace",
            target: namespace,
            node: "-".to_string(),
        }),
        CatalogOp::CasWrite { .. } | CatalogOp::Delete { .. } => None,
    }
}

fn print_plan(scheduled: usize, report: &ReconcileReport, calls: Vec<PlannedCall>) {
    println!(
        "{} {} register | {} deregister | {} namespaces | {} scheduled by reaper",
        "plan:".bold(),
        report.registered,
        report.deregistered,
        report.namespaces_created,
        scheduled,
    );
    if report.register_failed + report.deregister_failed + report.namespace_failed > 0 {
        println!(
            "{} {} register, {} deregister, {} namespace failures",
            "failed:".red().bold(),
            report.register_failed,
            report.deregister_failed,
            report.namespace_failed,
        );
    }
    if calls.is_empty() {
        println!("No catalog calls.");
        return;
    }
    let mut table = Table::new(calls);
    table.with(Style::rounded());
    println!("{table}");
}
