//! Pipeline orchestration: artist enrichment and raw listening ingestion,
//! plus the wiring that builds both from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use spotlake_adapters::{AuthError, ClientCredentials, SpotifyClient};
use spotlake_core::PipelineError;
use spotlake_storage::{
    EnvSecretProvider, FileSecretProvider, HttpClientConfig, HttpFetcher, LocalObjectStore,
    SecretProvider, TokenBucketConfig, LATEST_VERSION,
};
use tracing::info;

pub mod config;
pub mod enrich;
pub mod ingest;
pub mod postgres;
pub mod warehouse;

#[cfg(test)]
mod test_support;

pub use config::{AppConfig, SecretsBackend};
pub use enrich::{missing_artist_ids, EnrichmentOutcome, EnrichmentPipeline, UpsertMerger};
pub use ingest::{IngestPipeline, IngestSummary, IngestTarget};
pub use postgres::{run_migrations, PgWarehouse, WarehouseTables};
pub use warehouse::{ArtistColumns, LastSeenPolicy, MemoryWarehouse, Warehouse};

pub const CRATE_NAME: &str = "spotlake-sync";

pub const CLIENT_ID_SECRET: &str = "spotify-client-id";
pub const CLIENT_SECRET_SECRET: &str = "spotify-client-secret";
pub const REFRESH_TOKEN_SECRET: &str = "spotify-refresh-token";

pub const USER_AGENT: &str = concat!("spotlake/", env!("CARGO_PKG_VERSION"));

/// Reads the latest version of `name`; a blank value counts as missing.
pub(crate) async fn read_secret(
    secrets: &dyn SecretProvider,
    name: &str,
) -> Result<String, PipelineError> {
    let value = secrets
        .get(name, LATEST_VERSION)
        .await
        .map_err(|err| PipelineError::SecretAccess {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
    if value.trim().is_empty() {
        return Err(PipelineError::SecretAccess {
            name: name.to_string(),
            reason: "secret value is empty".to_string(),
        });
    }
    Ok(value)
}

pub(crate) async fn load_client_credentials(
    secrets: &dyn SecretProvider,
) -> Result<ClientCredentials, PipelineError> {
    let client_id = read_secret(secrets, CLIENT_ID_SECRET).await?;
    let client_secret = read_secret(secrets, CLIENT_SECRET_SECRET).await?;
    Ok(ClientCredentials::new(client_id, client_secret))
}

pub(crate) fn auth_error(err: AuthError) -> PipelineError {
    PipelineError::Auth {
        status: err.status(),
        body: err.body().map(ToString::to_string),
        message: err.to_string(),
    }
}

/// Long-lived client handles, built once per process and shared by every
/// pipeline invocation.
#[derive(Clone)]
pub struct Services {
    pub config: AppConfig,
    pub enrichment: Arc<EnrichmentPipeline>,
    pub ingest: Arc<IngestPipeline>,
}

impl Services {
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(USER_AGENT.to_string()),
            token_bucket: config.http_requests_per_sec.filter(|rps| *rps > 0).map(|rps| {
                TokenBucketConfig {
                    capacity: rps,
                    refill_every: Duration::from_secs(1) / rps,
                }
            }),
            ..HttpClientConfig::default()
        })?;
        let spotify = Arc::new(SpotifyClient::new(http));

        let secrets: Arc<dyn SecretProvider> = match config.secrets_backend {
            SecretsBackend::File => Arc::new(FileSecretProvider::new(config.secrets_dir.clone())),
            SecretsBackend::Env => Arc::new(EnvSecretProvider),
        };

        let warehouse = Arc::new(
            PgWarehouse::connect(&config.database_url, config.tables.clone())
                .await
                .context("connecting to the warehouse")?,
        );
        let store = Arc::new(LocalObjectStore::new(config.object_store_root.clone()));

        let enrichment = Arc::new(EnrichmentPipeline::new(
            warehouse,
            secrets.clone(),
            spotify.clone(),
            spotify.clone(),
            config.last_seen_policy,
        ));
        let ingest = Arc::new(IngestPipeline::new(
            secrets,
            spotify.clone(),
            spotify,
            store,
            config.bucket.clone(),
            config.raw_prefix.clone(),
        ));

        info!(
            dataset = %config.tables.dataset,
            bucket = %config.bucket,
            policy = ?config.last_seen_policy,
            "pipeline services ready"
        );
        Ok(Self {
            config,
            enrichment,
            ingest,
        })
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        Self::from_config(config).await
    }
}
