//! Raw listening-data ingestion into date-partitioned object storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use spotlake_adapters::{
    ListeningSource, TimeRange, TokenSource, TopItemKind, MAX_TOP_ITEMS_LIMIT,
};
use spotlake_core::PipelineError;
use spotlake_storage::{
    partitioned_object_path, ObjectStore, StoredObject, CONTENT_TYPE_JSON, CONTENT_TYPE_NDJSON,
};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::{auth_error, load_client_credentials, read_secret, REFRESH_TOKEN_SECRET};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum IngestTarget {
    Top {
        kind: TopItemKind,
        time_range: TimeRange,
        limit: u32,
    },
    Playlist {
        playlist_id: String,
    },
}

impl Default for IngestTarget {
    fn default() -> Self {
        Self::Top {
            kind: TopItemKind::Tracks,
            time_range: TimeRange::ShortTerm,
            limit: MAX_TOP_ITEMS_LIMIT,
        }
    }
}

impl IngestTarget {
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self {
            Self::Top { limit, .. } if !(1..=MAX_TOP_ITEMS_LIMIT).contains(limit) => {
                Err(PipelineError::Configuration(format!(
                    "top items limit must be between 1 and {MAX_TOP_ITEMS_LIMIT}, got {limit}"
                )))
            }
            Self::Playlist { playlist_id } if playlist_id.trim().is_empty() => Err(
                PipelineError::Configuration("playlist id must not be empty".to_string()),
            ),
            Self::Playlist { playlist_id }
                if !playlist_id.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                Err(PipelineError::Configuration(format!(
                    "playlist id {playlist_id:?} must be alphanumeric"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Base file name for stored objects.
    pub fn object_name(&self) -> String {
        match self {
            Self::Top {
                kind, time_range, ..
            } => format!("top_{}_{}", kind.as_str(), time_range.as_str()),
            Self::Playlist { playlist_id } => format!("playlist_{playlist_id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub target_name: String,
    pub item_count: usize,
    pub objects: Vec<StoredObject>,
}

/// One JSON document per line from the payload's `items` array.
pub fn items_to_ndjson(payload: &JsonValue) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for item in payload
        .get("items")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
    {
        serde_json::to_writer(&mut out, item)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn item_count(payload: &JsonValue) -> usize {
    payload
        .get("items")
        .or_else(|| payload.pointer("/tracks/items"))
        .and_then(JsonValue::as_array)
        .map_or(0, Vec::len)
}

pub struct IngestPipeline {
    secrets: Arc<dyn spotlake_storage::SecretProvider>,
    tokens: Arc<dyn TokenSource>,
    listening: Arc<dyn ListeningSource>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl IngestPipeline {
    pub fn new(
        secrets: Arc<dyn spotlake_storage::SecretProvider>,
        tokens: Arc<dyn TokenSource>,
        listening: Arc<dyn ListeningSource>,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            secrets,
            tokens,
            listening,
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    pub async fn run_once(&self, target: &IngestTarget) -> Result<IngestSummary, PipelineError> {
        self.run_at(target, Utc::now()).await
    }

    /// Every failure here is fatal for the run.
    pub async fn run_at(
        &self,
        target: &IngestTarget,
        at: DateTime<Utc>,
    ) -> Result<IngestSummary, PipelineError> {
        target.validate()?;
        let run_id = Uuid::new_v4();
        let target_name = target.object_name();
        let span = info_span!("ingest_run", %run_id, object_name = %target_name);
        async {
            let payload = self.fetch(target).await?;
            let item_count = item_count(&payload);

            let pretty = serde_json::to_vec_pretty(&payload)
                .map_err(|err| PipelineError::Storage(format!("encoding raw payload: {err}")))?;
            let mut objects = vec![
                self.put(&target_name, at, "json", &pretty, CONTENT_TYPE_JSON)
                    .await?,
            ];
            if matches!(target, IngestTarget::Top { .. }) {
                let ndjson = items_to_ndjson(&payload)
                    .map_err(|err| PipelineError::Storage(format!("encoding ndjson: {err}")))?;
                objects.push(
                    self.put(&target_name, at, "ndjson", &ndjson, CONTENT_TYPE_NDJSON)
                        .await?,
                );
            }

            info!(item_count, objects = objects.len(), "raw ingest stored");
            Ok::<_, PipelineError>(IngestSummary {
                target_name: target_name.clone(),
                item_count,
                objects,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch(&self, target: &IngestTarget) -> Result<JsonValue, PipelineError> {
        let credentials = load_client_credentials(self.secrets.as_ref()).await?;
        let fetch_err = |err: spotlake_storage::FetchError| PipelineError::UpstreamFetch(err.to_string());
        match target {
            IngestTarget::Top {
                kind,
                time_range,
                limit,
            } => {
                let refresh_token = read_secret(self.secrets.as_ref(), REFRESH_TOKEN_SECRET).await?;
                let token = self
                    .tokens
                    .refresh(&credentials, &refresh_token)
                    .await
                    .map_err(auth_error)?;
                self.listening
                    .fetch_top_items(&token, *kind, *time_range, *limit)
                    .await
                    .map_err(fetch_err)
            }
            IngestTarget::Playlist { playlist_id } => {
                let token = self
                    .tokens
                    .client_credentials(&credentials)
                    .await
                    .map_err(auth_error)?;
                self.listening
                    .fetch_playlist(&token, playlist_id)
                    .await
                    .map_err(fetch_err)
            }
        }
    }

    async fn put(
        &self,
        name: &str,
        at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, PipelineError> {
        let path = partitioned_object_path(&self.prefix, name, at, extension);
        self.store
            .put(&self.bucket, &path, bytes, content_type)
            .await
            .map_err(|err| PipelineError::Storage(format!("{err:#}")))
    }
}
