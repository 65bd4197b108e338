//! catsync: keeps an external service catalog in step with a desired set
//! of registrations.
//!
//! # Usage
//!
//! ```text
//! catsync check [--settings <path>] [--json]
//! catsync plan --desired <path> [--existing <path>] [--settings <path>] [--json]
//! catsync run [--settings <path>] [--existing <path>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, plan::PlanArgs, run::RunArgs};

#[derive(Parser, Debug)]
#[command(
    name = "catsync",
    version,
    about = "Reconcile service registrations with an external catalog",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate a settings file.
    Check(CheckArgs),

    /// Show the catalog calls one reconciliation pass would make.
    Plan(PlanArgs),

    /// Run the daemon against an in-process catalog until Ctrl-C.
    Run(RunArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Check(args) => args.run(),
        Commands::Plan(args) => args.run(),
        Commands::Run(args) => args.run(),
    }
}
