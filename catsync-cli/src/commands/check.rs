//! `catsync check`: load and validate settings.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use catsync_daemon::Settings;

use super::load_settings;

/// Arguments for `catsync check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Settings file (YAML). Defaults are checked when omitted.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Print the effective settings as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct SettingRow {
    #[tabled(rename = "setting")]
    name: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let settings = load_settings(self.settings.as_deref())?;
        settings.validate()?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&settings).context("failed to serialize settings")?
            );
            return Ok(());
        }

        let source = self
            .settings
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "defaults".to_string());
        println!("{} {source}", "settings OK:".green().bold());
        let mut table = Table::new(rows(&settings));
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn rows(settings: &Settings) -> Vec<SettingRow> {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    vec![
        SettingRow {
            name: "node",
            value: settings.node_name.clone(),
        },
        SettingRow {
            name: "ownership tag",
            value: settings.ownership_tag.clone(),
        },
        SettingRow {
            name: "datacenter",
            value: optional(&settings.datacenter),
        },
        SettingRow {
            name: "namespaces",
            value: settings.enable_namespaces.to_string(),
        },
        SettingRow {
            name: "kinds",
            value: settings.kinds.join(", "),
        },
        SettingRow {
            name: "sync period",
            value: format!("{}ms", settings.sync_period_ms),
        },
        SettingRow {
            name: "service poll period",
            value: format!("{}ms", settings.service_poll_period_ms),
        },
        SettingRow {
            name: "registrations file",
            value: settings
                .registrations_file
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        },
    ]
}
