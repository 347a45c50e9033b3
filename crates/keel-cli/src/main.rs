//! Keel CLI - drive the offline-first sync engine from a terminal
//!
//! Record local mutations, run sync passes and settle conflicts.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use crate::cli::{Cli, Commands};
use crate::commands::changes::{run_changes, run_discard, run_gc, run_retry};
use crate::commands::common::Paths;
use crate::commands::config::run_config;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::health::run_health;
use crate::commands::record::run_record;
use crate::commands::show::run_show;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(
                    "keel=info"
                        .parse()
                        .unwrap_or_else(|_| LevelFilter::INFO.into()),
                )
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths {
        db_path: cli.db_path,
        config: cli.config,
    };

    match cli.command {
        Commands::Record {
            entity_type,
            kind,
            id,
            payload,
        } => {
            run_record(&entity_type, &kind, id.as_deref(), payload.as_deref(), &paths).await?;
        }
        Commands::Show {
            entity_type,
            limit,
            json,
        } => run_show(&entity_type, limit, json, &paths).await?,
        Commands::Sync { json } => run_sync(json, &paths).await?,
        Commands::Watch {
            interval,
            no_realtime,
        } => run_watch(interval, no_realtime, &paths).await?,
        Commands::Status { json } => run_status(json, &paths).await?,
        Commands::Changes { state, limit, json } => {
            run_changes(state, limit, json, &paths).await?;
        }
        Commands::Retry { id } => run_retry(&id, &paths).await?,
        Commands::Discard { id } => run_discard(&id, &paths).await?,
        Commands::Conflicts { all, limit, json } => {
            run_conflicts(all, limit, json, &paths).await?;
        }
        Commands::Resolve { id, side } => run_resolve(id, side, &paths).await?,
        Commands::Gc => run_gc(&paths).await?,
        Commands::Health => run_health(&paths).await?,
        Commands::Config { command } => run_config(&command, &paths)?,
    }

    Ok(())
}
