mod commands;
mod config;
mod peer;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::commands::{
    LogArgs, cmd_anchors, cmd_delete, cmd_digest, cmd_list, cmd_log, cmd_stats,
};
use crate::config::Config;
use crate::peer::HttpPeer;
use nibble_core::calendar::{Calendar, WeekAnchor};
use nibble_core::events::{
    Analytics, EventBus, RefreshNotifier, TracingAnalytics, spawn_analytics_listener,
    spawn_refresh_listener,
};
use nibble_core::models::{Origin, Target};
use nibble_core::service::{Ledger, open_store};
use nibble_core::sync::{PeerTransport, SyncBridge};

#[derive(Parser)]
#[command(
    name = "nibble",
    version,
    about = "Runs one nibble device: the shared entry ledger, its sync endpoint and peer forwarding"
)]
struct Cli {
    /// Data directory holding the ledger (default: derived from the app group)
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// Config file (default: config.toml in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host this device: sync receive endpoint and creation entry point
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
        /// Disable pairing key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
    /// Log an entry and forward it to the paired device
    Log {
        /// What was eaten
        name: String,
        /// Log it for the companion instead of yourself
        #[arg(short, long)]
        companion: bool,
        /// Provenance tag (default: this device's app)
        #[arg(long)]
        origin: Option<Origin>,
        /// Pre-assigned entry ID
        #[arg(long)]
        id: Option<Uuid>,
        /// When (RFC 3339, YYYY-MM-DD or today/yesterday; default: now)
        #[arg(long)]
        at: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List entries, newest first
    List {
        /// Only today's entries
        #[arg(long)]
        today: bool,
        /// Only entries for this target: self or companion
        #[arg(long)]
        target: Option<Target>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an entry by ID, or every entry
    Delete {
        /// Entry ID to delete
        id: Option<Uuid>,
        /// Delete all entries
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show totals, companion share and streaks
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the weekly digest for the week containing a date
    Digest {
        /// Any instant inside the week (default: now)
        at: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change the week-start and digest-unlock anchors
    Anchors {
        /// e.g. "mon 12:15" or "2 12:15" (1 = Sunday)
        #[arg(long)]
        week_start: Option<WeekAnchor>,
        /// e.g. "sun 18:00"
        #[arg(long)]
        digest_unlock: Option<WeekAnchor>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Stands in for the widget host: derived views are recomputed on demand,
/// so a refresh only needs to be noted.
struct LogRefresh;

impl RefreshNotifier for LogRefresh {
    fn refresh(&self) -> Result<()> {
        tracing::debug!("derived views refreshed");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.data_dir, cli.config)?;
    let analytics: Arc<dyn Analytics> = Arc::new(TracingAnalytics);

    // A ledger that cannot be opened stops the process.
    let store = Arc::new(open_store(&config.db_path, analytics.as_ref())?);

    let events = EventBus::default();
    spawn_analytics_listener(&events, analytics);
    spawn_refresh_listener(&events, Arc::new(LogRefresh));

    let transport = match &config.peer {
        Some(peer) => {
            let peer = HttpPeer::new(peer, config.probe_timeout)?;
            Some(Arc::new(peer) as Arc<dyn PeerTransport>)
        }
        None => None,
    };
    let (bridge, bridge_task) =
        SyncBridge::spawn(config.device, store.clone(), transport, events.clone());
    let calendar = Calendar::local(config.week_start, config.digest_unlock);
    let ledger = Ledger::new(store, events, calendar)?.with_bridge(bridge.clone());
    let device = config.device;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_pairing_key()?.0)
            };
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let port = port.unwrap_or(config.port);
            return server::start_server(Arc::new(ledger), bridge, port, &bind, api_key).await;
        }
        Commands::Log {
            name,
            companion,
            origin,
            id,
            at,
            json,
        } => {
            let args = LogArgs {
                name,
                companion,
                origin,
                id,
                at,
            };
            cmd_log(&ledger, device, args, json)?;
        }
        Commands::List {
            today,
            target,
            json,
        } => cmd_list(&ledger, today, target, json)?,
        Commands::Delete { id, all, json } => cmd_delete(&ledger, id, all, json)?,
        Commands::Stats { json } => cmd_stats(&ledger, json)?,
        Commands::Digest { at, json } => cmd_digest(&ledger, at.as_deref(), json)?,
        Commands::Anchors {
            week_start,
            digest_unlock,
            json,
        } => cmd_anchors(&ledger, week_start, digest_unlock, json)?,
    }

    // Let a queued forward finish before the process exits.
    drop(ledger);
    drop(bridge);
    bridge_task.await?;
    Ok(())
}
