//! Tally CLI - keep a personal ledger from the terminal
//!
//! Every change is written to the local store first and pushed to Supabase
//! when the network allows; `tally sync` catches up on everything else.

mod auth;
mod cli;
mod commands;
mod error;


use clap::Parser;
use tally_core::config::EngineConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::add::run_add;
use crate::commands::auth_cmd::run_auth;
use crate::commands::common::CliContext;
use crate::commands::completions::run_completions;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::{run_list, run_show};
use crate::commands::status::run_status;
use crate::commands::sync::{run_sync, run_sync_cleanup, run_sync_conflicts, run_sync_queue};
use crate::error::CliError;

const DEFAULT_LOG_DIRECTIVE: &str = "tally=info";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = DEFAULT_LOG_DIRECTIVE.parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let ctx = CliContext::new(EngineConfig::from_env()?, cli.db_path, cli.offline);

    match cli.command {
        Commands::Add { record } => run_add(&ctx, record).await?,
        Commands::List {
            kind,
            limit,
            filter,
            json,
        } => run_list(&ctx, kind.into(), limit, filter.as_deref(), json).await?,
        Commands::Show { kind, id } => run_show(&ctx, kind.into(), &id).await?,
        Commands::Edit {
            kind,
            id,
            assignments,
        } => run_edit(&ctx, kind.into(), &id, &assignments).await?,
        Commands::Delete { kind, id } => run_delete(&ctx, kind.into(), &id).await?,
        Commands::Sync { command, full } => match command {
            None => run_sync(&ctx, full).await?,
            Some(SyncCommands::Conflicts { limit, json }) => {
                run_sync_conflicts(&ctx, limit, json).await?;
            }
            Some(SyncCommands::Queue { json }) => run_sync_queue(&ctx, json).await?,
            Some(SyncCommands::Cleanup) => run_sync_cleanup(&ctx).await?,
        },
        Commands::Status { json } => run_status(&ctx, json).await?,
        Commands::Auth { command } => run_auth(&ctx, command).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
