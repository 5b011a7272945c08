use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tally_core::EntityKind;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Keep a personal ledger that works offline and syncs when it can")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Work against the local store only; changes stay queued
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record something new
    #[command(alias = "new")]
    Add {
        #[command(subcommand)]
        record: AddCommands,
    },
    /// List records of one kind
    List {
        #[arg(value_enum)]
        kind: KindArg,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only records whose indexed field equals a value, e.g. `occurred_on=2026-10-01`
        #[arg(long, value_name = "FIELD=VALUE")]
        filter: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a single record
    Show {
        #[arg(value_enum)]
        kind: KindArg,
        /// Record ID
        id: String,
    },
    /// Change fields of an existing record
    Edit {
        #[arg(value_enum)]
        kind: KindArg,
        /// Record ID
        id: String,
        /// Field assignment; values are read as JSON when they parse, text otherwise
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        assignments: Vec<String>,
    },
    /// Delete an existing record
    Delete {
        #[arg(value_enum)]
        kind: KindArg,
        /// Record ID
        id: String,
    },
    /// Push queued changes and pull remote ones
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
        /// Ignore stored cursors and drop local copies deleted elsewhere
        #[arg(long)]
        full: bool,
    },
    /// Show pending changes, queue health and conflicts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Authenticate with Supabase
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum AddCommands {
    /// Income or expense entry
    Entry(EntryArgs),
    /// Money owed to or by someone
    Debt {
        counterparty: String,
        /// Amount, e.g. `120` or `120.50`
        amount: String,
        /// Due date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        due: Option<String>,
    },
    /// Savings goal
    Goal {
        name: String,
        /// Target amount
        target: String,
        /// Amount already saved
        #[arg(long, value_name = "AMOUNT")]
        saved: Option<String>,
        /// Target date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        by: Option<String>,
    },
    /// Custom category
    Category {
        name: String,
        #[arg(long)]
        icon: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    /// Hide a category from pickers
    Hide { category_id: String },
    /// Pin a category to a position
    Order { category_id: String, position: i64 },
}

#[derive(Args)]
pub struct EntryArgs {
    /// Amount, e.g. `12` or `12.50`
    pub amount: String,
    /// Record income instead of an expense
    #[arg(long)]
    pub income: bool,
    /// Day the money moved (YYYY-MM-DD, defaults to today)
    #[arg(long, value_name = "DATE")]
    pub on: Option<String>,
    /// Category ID
    #[arg(long, value_name = "ID")]
    pub category: Option<String>,
    /// Free-form note
    #[arg(long)]
    pub note: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Entry,
    Debt,
    Goal,
    Category,
    HiddenCategory,
    CategoryOrder,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Entry => Self::Entry,
            KindArg::Debt => Self::Debt,
            KindArg::Goal => Self::Goal,
            KindArg::Category => Self::Category,
            KindArg::HiddenCategory => Self::HiddenCategory,
            KindArg::CategoryOrder => Self::CategoryOrder,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queued operations that ran out of retries
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop exhausted queue entries past their retention
    Cleanup,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Login with Supabase email/password and store the session
    Login {
        /// Supabase account email
        #[arg(long, value_name = "EMAIL")]
        email: String,
        /// Supabase account password
        #[arg(long, value_name = "PASSWORD")]
        password: String,
    },
    /// Show auth status
    Status,
    /// Logout and clear the stored session
    Logout {
        /// Also remove every local record of the signed-in user
        #[arg(long)]
        forget: bool,
    },
}
