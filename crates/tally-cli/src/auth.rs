//! CLI Supabase session persistence in the user's config directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tally_core::auth::{
    AuthError, AuthResult, AuthSession, SessionPersistence, SupabaseAuthClient,
};
use tally_core::config::EngineConfig;

use crate::error::CliError;

const SESSION_FILE_NAME: &str = "session.json";

/// Session kept as a JSON file readable only by the current user
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> AuthResult<Self> {
        let dir = dirs::config_dir().ok_or_else(|| {
            AuthError::SessionStorage("Failed to resolve CLI config directory".to_string())
        })?;
        Ok(Self::new(dir.join("tally").join(SESSION_FILE_NAME)))
    }
}

fn storage_error(error: &io::Error) -> AuthError {
    AuthError::SessionStorage(error.to_string())
}

impl SessionPersistence for SessionFile {
    fn load_session(&self) -> AuthResult<Option<AuthSession>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(storage_error(&error)),
        }
    }

    fn save_session(&self, session: &AuthSession) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|error| storage_error(&error))?;
        }

        let raw = serde_json::to_string(session)?;
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, raw).map_err(|error| storage_error(&error))?;
        restrict_permissions(&staged)?;
        fs::rename(&staged, &self.path).map_err(|error| storage_error(&error))
    }

    fn clear_session(&self) -> AuthResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(storage_error(&error)),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> AuthResult<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|error| storage_error(&error))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn restrict_permissions(_path: &Path) -> AuthResult<()> {
    Ok(())
}

pub type CliAuthClient = SupabaseAuthClient<SessionFile>;

/// Auth client for the configured Supabase project
pub fn auth_client(config: &EngineConfig) -> Result<CliAuthClient, CliError> {
    let supabase = config
        .supabase
        .as_ref()
        .ok_or(CliError::SyncNotConfigured)?;
    Ok(SupabaseAuthClient::with_timeout(
        &supabase.url,
        supabase.anon_key.clone(),
        SessionFile::default_location()?,
        config.sync.http_timeout,
    )?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tally_core::auth::AuthUser;

    use super::*;

    fn session() -> AuthSession {
        AuthSession {
            access_token: "secret-access-token".to_string(),
            refresh_token: "secret-refresh-token".to_string(),
            expires_at: 1_700_000_000,
            user: AuthUser {
                id: "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".to_string(),
                email: Some("me@example.com".to_string()),
            },
        }
    }

    #[test]
    fn session_file_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionFile::new(dir.path().join("nested").join(SESSION_FILE_NAME));

        assert_eq!(store.load_session().unwrap(), None);
        store.save_session(&session()).unwrap();
        assert_eq!(store.load_session().unwrap(), Some(session()));

        store.clear_session().unwrap();
        assert_eq!(store.load_session().unwrap(), None);
        store.clear_session().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn session_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = SessionFile::new(dir.path().join(SESSION_FILE_NAME));
        store.save_session(&session()).unwrap();

        let mode = fs::metadata(&store.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_session_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionFile::new(dir.path().join(SESSION_FILE_NAME));
        fs::write(&store.path, "{not json").unwrap();

        assert!(matches!(store.load_session(), Err(AuthError::Json(_))));
    }

    #[test]
    fn auth_client_requires_supabase_config() {
        let result = auth_client(&EngineConfig::default());
        assert!(matches!(result, Err(CliError::SyncNotConfigured)));
    }
}
