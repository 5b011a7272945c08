//! Runtime configuration read from the environment.

use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::{is_http_url, normalize_text_option};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Supabase project the client talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

/// Knobs of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Rows requested per pull page
    pub page_size: u32,
    /// Attempts a queued operation gets before it is kept as exhausted
    pub max_retries: u32,
    /// Age after which exhausted queue entries may be pruned
    pub queue_retention: Duration,
    pub http_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_retries: 5,
            queue_retention: Duration::from_secs(30 * 86_400),
            http_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// `None` runs the engine local-only
    pub supabase: Option<SupabaseConfig>,
    pub db_path: Option<PathBuf>,
    pub sync: SyncSettings,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let supabase = match (
            optional_trimmed(&lookup, "TALLY_SUPABASE_URL"),
            optional_trimmed(&lookup, "TALLY_SUPABASE_ANON_KEY"),
        ) {
            (None, None) => None,
            (Some(url), Some(anon_key)) => {
                if !is_http_url(&url) {
                    return Err(ConfigError::Invalid(
                        "TALLY_SUPABASE_URL must start with http:// or https://".to_string(),
                    ));
                }
                Some(SupabaseConfig {
                    url: url.trim_end_matches('/').to_string(),
                    anon_key,
                })
            }
            _ => {
                return Err(ConfigError::Invalid(
                    "TALLY_SUPABASE_URL and TALLY_SUPABASE_ANON_KEY must be set together"
                        .to_string(),
                ))
            }
        };

        let db_path = optional_trimmed(&lookup, "TALLY_DB_PATH").map(PathBuf::from);

        let defaults = SyncSettings::default();
        let page_size = bounded(
            &lookup,
            "TALLY_SYNC_PAGE_SIZE",
            defaults.page_size.into(),
            1..=1_000,
        )?;
        let max_retries = bounded(
            &lookup,
            "TALLY_QUEUE_MAX_RETRIES",
            defaults.max_retries.into(),
            1..=100,
        )?;
        let retention_days = bounded(&lookup, "TALLY_QUEUE_RETENTION_DAYS", 30, 1..=365)?;
        let http_timeout_secs = bounded(&lookup, "TALLY_HTTP_TIMEOUT_SECS", 15, 1..=120)?;

        Ok(Self {
            supabase,
            db_path,
            sync: SyncSettings {
                page_size: u32::try_from(page_size).unwrap_or(defaults.page_size),
                max_retries: u32::try_from(max_retries).unwrap_or(defaults.max_retries),
                queue_retention: Duration::from_secs(retention_days * 86_400),
                http_timeout: Duration::from_secs(http_timeout_secs),
            },
        })
    }
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = raw.parse::<u64>().map_err(|_| invalid())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
