use std::io;

use tally_core::auth::AuthError;
use tally_core::config::ConfigError;
use tally_core::remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Invalid amount '{0}': expected a number with at most two decimals")]
    InvalidAmount(String),
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Invalid assignment '{0}': expected FIELD=VALUE")]
    InvalidAssignment(String),
    #[error("Not signed in. Run `tally auth login` first.")]
    NotSignedIn,
    #[error(
        "Sync is not configured. Set TALLY_SUPABASE_URL and TALLY_SUPABASE_ANON_KEY to use Tally."
    )]
    SyncNotConfigured,
    #[error("Sync did not complete: {0}")]
    SyncBlocked(String),
}
