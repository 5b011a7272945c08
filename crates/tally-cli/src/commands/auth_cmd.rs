use tally_core::auth::SessionPersistence;

use crate::auth::{auth_client, SessionFile};
use crate::cli::AuthCommands;
use crate::commands::common::{format_sync_timestamp, open_local_ledger, CliContext};
use crate::error::CliError;

pub async fn run_auth(ctx: &CliContext, command: AuthCommands) -> Result<(), CliError> {
    match command {
        AuthCommands::Login { email, password } => {
            let auth = auth_client(&ctx.config)?;
            let session = auth.sign_in(&email, &password).await?;
            let email_label = session.user.email.as_deref().unwrap_or("(no email)");
            println!("Signed in as {email_label}");
            Ok(())
        }
        AuthCommands::Status => {
            let auth = auth_client(&ctx.config)?;
            let Some(session) = auth.stored_session()? else {
                println!("Not signed in.");
                return Ok(());
            };

            let email_label = session.user.email.as_deref().unwrap_or("(no email)");
            let expires = format_sync_timestamp(session.expires_at.saturating_mul(1000));
            if session.is_expired() {
                println!(
                    "Signed in as {email_label} (session expired at {expires}; refreshed on next sync)"
                );
            } else {
                println!("Signed in as {email_label} (expires {expires})");
            }
            Ok(())
        }
        AuthCommands::Logout { forget } => {
            if forget {
                let ledger = open_local_ledger(ctx).await?;
                let removed = ledger.logout().await?;
                println!("Removed {removed} local rows");
            }

            let auth = auth_client(&ctx.config)?;
            if let Some(session) = auth.stored_session()? {
                if let Err(error) = auth.sign_out(&session.access_token).await {
                    tracing::warn!("Remote sign-out failed, clearing local session: {error}");
                    SessionFile::default_location()?.clear_session()?;
                }
            }

            println!("Signed out");
            Ok(())
        }
    }
}
