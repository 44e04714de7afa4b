//! Typed runtime configuration, read from the environment once at startup.

use std::path::PathBuf;
use std::time::Duration;

use spotlake_core::PipelineError;

use crate::postgres::WarehouseTables;
use crate::warehouse::LastSeenPolicy;

pub const DEFAULT_OBJECT_STORE_ROOT: &str = "./object-store";
pub const DEFAULT_SECRETS_DIR: &str = "./secrets";
pub const DEFAULT_RAW_PREFIX: &str = "spotify/raw";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WEB_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretsBackend {
    /// Versioned files under `SPOTLAKE_SECRETS_DIR`.
    #[default]
    File,
    /// `SPOTLAKE_SECRET_<NAME>` variables.
    Env,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub tables: WarehouseTables,
    pub bucket: String,
    pub object_store_root: PathBuf,
    pub secrets_dir: PathBuf,
    pub secrets_backend: SecretsBackend,
    pub raw_prefix: String,
    pub http_timeout_secs: u64,
    pub http_requests_per_sec: Option<u32>,
    pub web_port: u16,
    pub last_seen_policy: LastSeenPolicy,
    pub playlist_id: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                PipelineError::Configuration(format!("missing required environment variable {key}"))
            })
        };
        let identifier = |key: &str| {
            let value = required(key)?;
            validate_identifier(key, &value)?;
            Ok::<_, PipelineError>(value)
        };

        let tables = WarehouseTables {
            dataset: identifier("SPOTLAKE_DATASET")?,
            stg_tracks: identifier("SPOTLAKE_STG_TRACKS_TABLE")?,
            dim_artists: identifier("SPOTLAKE_DIM_ARTISTS_TABLE")?,
        };

        let secrets_backend = match get("SPOTLAKE_SECRETS_BACKEND").as_deref() {
            None | Some("file") => SecretsBackend::File,
            Some("env") => SecretsBackend::Env,
            Some(other) => {
                return Err(PipelineError::Configuration(format!(
                    "SPOTLAKE_SECRETS_BACKEND must be file or env, got {other:?}"
                )))
            }
        };

        let http_timeout_secs =
            parse_number(&get, "SPOTLAKE_HTTP_TIMEOUT_SECS")?.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        if http_timeout_secs == 0 {
            return Err(PipelineError::Configuration(
                "SPOTLAKE_HTTP_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        let last_seen_policy = match get("SPOTLAKE_LAST_SEEN_POLICY") {
            Some(value) => value.parse().map_err(PipelineError::Configuration)?,
            None => LastSeenPolicy::default(),
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            tables,
            bucket: required("SPOTLAKE_BUCKET")?,
            object_store_root: get("SPOTLAKE_OBJECT_STORE_ROOT")
                .unwrap_or_else(|| DEFAULT_OBJECT_STORE_ROOT.to_string())
                .into(),
            secrets_dir: get("SPOTLAKE_SECRETS_DIR")
                .unwrap_or_else(|| DEFAULT_SECRETS_DIR.to_string())
                .into(),
            secrets_backend,
            raw_prefix: get("SPOTLAKE_RAW_PREFIX").unwrap_or_else(|| DEFAULT_RAW_PREFIX.to_string()),
            http_timeout_secs,
            http_requests_per_sec: parse_number(&get, "SPOTLAKE_HTTP_REQUESTS_PER_SEC")?,
            web_port: parse_number(&get, "SPOTLAKE_WEB_PORT")?.unwrap_or(DEFAULT_WEB_PORT),
            last_seen_policy,
            playlist_id: get("SPOTLAKE_PLAYLIST_ID"),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_number<T, G>(get: &G, key: &str) -> Result<Option<T>, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|value| {
            value.parse::<T>().map_err(|err| {
                PipelineError::Configuration(format!("{key}={value:?} is not a valid number: {err}"))
            })
        })
        .transpose()
}

/// Accepts plain SQL identifiers only: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(key: &str, value: &str) -> Result<(), PipelineError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Configuration(format!(
            "{key}={value:?} is not a plain SQL identifier"
        )))
    }
}
