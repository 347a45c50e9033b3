use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Offline-first sync for the Keel boat logbook")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the sync settings file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a local mutation and queue it for sync
    Record {
        /// Entity type (boat, trip, crew_member, ...)
        entity_type: String,
        /// Change kind: create, update, delete, or a custom domain kind
        #[arg(short, long, default_value = "create")]
        kind: String,
        /// Entity id (a new one is generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// JSON payload (read from stdin when omitted)
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// Show local entities of a type
    Show {
        entity_type: String,
        /// Number of entities to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one full sync pass
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing periodically and on server notifications until Ctrl-C
    Watch {
        /// Override the periodic interval in seconds
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Disable the realtime channel
        #[arg(long)]
        no_realtime: bool,
    },
    /// Show pending work, failures and conflicts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List change log records in a state
    Changes {
        #[arg(long, value_enum, default_value_t = ChangeStateArg::Pending)]
        state: ChangeStateArg,
        /// Number of changes to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-queue a failed change
    Retry {
        /// Change id
        id: String,
    },
    /// Drop a queued or failed change
    Discard {
        /// Change id
        id: String,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a sync conflict
    Resolve {
        /// Conflict id
        id: i64,
        /// Which version wins
        #[arg(long = "use", value_enum)]
        side: ResolveSide,
    },
    /// Delete synced change records older than the retention window
    Gc,
    /// Check that the sync server is reachable
    Health,
    /// Inspect sync settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ChangeStateArg {
    Pending,
    Syncing,
    Synced,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolveSide {
    Local,
    Remote,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the resolved settings
    Show,
    /// Print the settings file location
    Path,
}
