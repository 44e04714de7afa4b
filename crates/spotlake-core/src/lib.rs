//! Core domain model and error kinds for spotlake.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "spotlake-core";

/// Opaque upstream artist identifier, unique across facts and the dimension.
pub type ArtistId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistImage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

/// Artist object as returned by the upstream `/artists` endpoint.
///
/// Every field is optional on the wire; `genres` and `images` tolerate both a
/// missing key and an explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtistRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub popularity: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub genres: Vec<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<ArtistImage>,
}

impl ArtistRecord {
    /// URL of the first image in provider order, if it has one.
    pub fn primary_image_url(&self) -> Option<&str> {
        self.images.first().and_then(|image| image.url.as_deref())
    }

    /// Identifier if present and non-empty.
    pub fn artist_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One artist prepared for the dimension upsert, in batch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistUpsert {
    pub artist_id: ArtistId,
    pub name: Option<String>,
    pub popularity: Option<i64>,
    pub genres: Vec<String>,
    pub uri: Option<String>,
    pub image_url: Option<String>,
}

impl ArtistUpsert {
    /// Returns `None` for records without a usable identifier.
    pub fn from_record(record: &ArtistRecord) -> Option<Self> {
        let artist_id = record.artist_id()?.to_string();
        Some(Self {
            artist_id,
            name: record.name.clone(),
            popularity: record.popularity,
            genres: record.genres.clone(),
            uri: record.uri.clone(),
            image_url: record.primary_image_url().map(ToString::to_string),
        })
    }
}

/// Persisted artist dimension row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimArtistRow {
    pub artist_id: ArtistId,
    pub artist_name: Option<String>,
    pub artist_popularity: Option<i64>,
    pub artist_genres: Vec<String>,
    pub artist_uri: Option<String>,
    pub artist_image_url: Option<String>,
    pub last_seen_snapshot_date: Option<NaiveDate>,
}

/// Error kinds surfaced by the pipelines.
///
/// Only [`PipelineError::UpstreamFetch`] is non-fatal: the enrichment pass
/// degrades it to an empty fetch result instead of aborting.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to access secret {name}: {reason}")]
    SecretAccess { name: String, reason: String },
    #[error("failed to obtain upstream access token: {message}")]
    Auth {
        status: Option<u16>,
        body: Option<String>,
        message: String,
    },
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),
    #[error("failed to merge artists into the dimension table: {0}")]
    Merge(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("warehouse query failed: {0}")]
    Warehouse(String),
    #[error("object storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UpstreamFetch(_))
    }
}
