//! `deskmirror` operator CLI.
//!
//! Usage:
//!   deskmirror status
//!   deskmirror refresh [--full]
//!   deskmirror search contacts email=acme.com [--live]
//!   deskmirror thread <conversation-id>
//!   deskmirror threads [ids...] [--missing]
//!   deskmirror poll

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::Notify;

use deskmirror_lib::config::{config_path, load_config};
use deskmirror_lib::poller::{run_refresh_poller, STARTUP_DELAY};
use deskmirror_lib::{EntityKind, MirrorService, SearchFilter};

#[derive(Parser)]
#[command(name = "deskmirror")]
#[command(about = "Local mirror of a helpdesk workspace")]
struct Cli {
    /// Path to config.json (defaults to ~/.deskmirror/config.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache age, counts and metadata
    Status,

    /// Refresh the mirror (policy-driven unless --full)
    Refresh {
        #[arg(long)]
        full: bool,
    },

    /// Search one entity kind with field=value filters
    Search {
        /// contacts, companies, admins or conversations
        kind: EntityKind,
        /// Case-insensitive substring filters, e.g. email=acme.com or location.city=lisbon
        filters: Vec<SearchFilter>,
        /// Query the helpdesk directly instead of the cache
        #[arg(long)]
        live: bool,
    },

    /// Build (or rebuild) one conversation thread
    Thread { conversation_id: String },

    /// Build threads for many conversations
    Threads {
        conversation_ids: Vec<String>,
        /// Every cached conversation that has no thread yet
        #[arg(long)]
        missing: bool,
    },

    /// Keep the mirror fresh in the foreground until Ctrl-C
    Poll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config_path);
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    let service = Arc::new(MirrorService::from_config(&config).map_err(|e| {
        anyhow::anyhow!("{} ({})", e, e.recovery_suggestion())
    })?);

    match cli.command {
        Commands::Status => {
            service.engine().load_from_disk().await;
            print_json(&service.get_status(), cli.pretty)?;
        }
        Commands::Refresh { full } => {
            let outcome = if full {
                service.force_full_refresh().await
            } else {
                service.ensure_fresh().await
            }
            .map_err(|e| anyhow::anyhow!("{} ({})", e, e.recovery_suggestion()))?;
            print_json(&outcome, cli.pretty)?;
        }
        Commands::Search {
            kind,
            filters,
            live,
        } => {
            let hits = service.search(kind, &filters, live).await?;
            print_json(&hits, cli.pretty)?;
        }
        Commands::Thread { conversation_id } => {
            let thread = service.build_thread(&conversation_id).await?;
            print_json(&thread, cli.pretty)?;
        }
        Commands::Threads {
            mut conversation_ids,
            missing,
        } => {
            if missing {
                service.engine().load_from_disk().await;
                conversation_ids.extend(service.conversations_missing_threads());
            }
            if conversation_ids.is_empty() {
                anyhow::bail!("No conversation ids given (pass ids or --missing)");
            }
            let report = service.build_threads_batch(&conversation_ids).await;
            print_json(&report, cli.pretty)?;
        }
        Commands::Poll => {
            let wake = Arc::new(Notify::new());
            let shutdown = Arc::new(Notify::new());
            let poller = tokio::spawn(run_refresh_poller(
                service.clone(),
                config.poll_interval(),
                STARTUP_DELAY,
                wake,
                shutdown.clone(),
            ));

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            log::info!("Ctrl-C received, stopping poller");
            shutdown.notify_one();
            let cycles = poller.await.context("poller task failed")?;
            log::info!("Poller stopped after {} cycles", cycles);
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", out);
    Ok(())
}
