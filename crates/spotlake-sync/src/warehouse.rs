//! Warehouse seam: fact snapshot reads, dimension reads and the artist upsert.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use spotlake_core::{ArtistId, ArtistUpsert, DimArtistRow, PipelineError};
use tokio::sync::Mutex;

pub const SNAPSHOT_DATE_FORMAT: &str = "%Y-%m-%d";

/// How a matched row's `last_seen_snapshot_date` is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastSeenPolicy {
    /// Always take the date of the run doing the write, even if older.
    #[default]
    Overwrite,
    /// Never move the date backwards.
    KeepLatest,
}

impl LastSeenPolicy {
    pub fn resolve(self, current: Option<NaiveDate>, incoming: Option<NaiveDate>) -> Option<NaiveDate> {
        match self {
            Self::Overwrite => incoming,
            Self::KeepLatest => match (current, incoming) {
                (Some(current), Some(incoming)) => Some(current.max(incoming)),
                (Some(current), None) => Some(current),
                (None, incoming) => incoming,
            },
        }
    }
}

impl FromStr for LastSeenPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "keep_latest" => Ok(Self::KeepLatest),
            other => Err(format!(
                "unknown last-seen policy {other:?} (expected overwrite|keep_latest)"
            )),
        }
    }
}

/// Best-effort `YYYY-MM-DD` parse; unparseable input yields `None`.
pub fn parse_snapshot_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), SNAPSHOT_DATE_FORMAT).ok()
}

/// Column-oriented merge batch. Index `i` of every vector describes the same
/// artist; builders must keep all vectors the same length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArtistColumns {
    pub artist_ids: Vec<String>,
    pub names: Vec<Option<String>>,
    pub popularities: Vec<Option<i64>>,
    pub genres_json: Vec<String>,
    pub uris: Vec<Option<String>>,
    pub image_urls: Vec<Option<String>>,
    pub snapshot_dates: Vec<String>,
}

impl ArtistColumns {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            artist_ids: Vec::with_capacity(capacity),
            names: Vec::with_capacity(capacity),
            popularities: Vec::with_capacity(capacity),
            genres_json: Vec::with_capacity(capacity),
            uris: Vec::with_capacity(capacity),
            image_urls: Vec::with_capacity(capacity),
            snapshot_dates: Vec::with_capacity(capacity),
        }
    }

    /// Flattens ordered rows into parallel columns stamped with `snapshot_date`.
    pub fn flatten(rows: &[ArtistUpsert], snapshot_date: NaiveDate) -> Result<Self, PipelineError> {
        let date = snapshot_date.format(SNAPSHOT_DATE_FORMAT).to_string();
        let mut columns = Self::with_capacity(rows.len());
        for row in rows {
            let genres = serde_json::to_string(&row.genres).map_err(|err| {
                PipelineError::Merge(format!("serializing genres for {}: {err}", row.artist_id))
            })?;
            columns.artist_ids.push(row.artist_id.clone());
            columns.names.push(row.name.clone());
            columns.popularities.push(row.popularity);
            columns.genres_json.push(genres);
            columns.uris.push(row.uri.clone());
            columns.image_urls.push(row.image_url.clone());
            columns.snapshot_dates.push(date.clone());
        }
        columns.ensure_aligned()?;
        Ok(columns)
    }

    pub fn len(&self) -> usize {
        self.artist_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artist_ids.is_empty()
    }

    /// Returns the shared column length, or a merge error if any column
    /// disagrees.
    pub fn ensure_aligned(&self) -> Result<usize, PipelineError> {
        let expected = self.artist_ids.len();
        let lengths = [
            ("artist_ids", self.artist_ids.len()),
            ("names", self.names.len()),
            ("popularities", self.popularities.len()),
            ("genres_json", self.genres_json.len()),
            ("uris", self.uris.len()),
            ("image_urls", self.image_urls.len()),
            ("snapshot_dates", self.snapshot_dates.len()),
        ];
        match lengths.iter().find(|(_, len)| *len != expected) {
            None => Ok(expected),
            Some((column, len)) => Err(PipelineError::Merge(format!(
                "column {column} has {len} entries, expected {expected}"
            ))),
        }
    }

    /// Reassembles the batch into dimension rows the way the upsert
    /// statement reads it: genres parsed as JSON, dates parsed best-effort.
    pub fn to_rows(&self) -> Result<Vec<DimArtistRow>, PipelineError> {
        let len = self.ensure_aligned()?;
        (0..len)
            .map(|i| {
                let genres: Vec<String> = serde_json::from_str(&self.genres_json[i]).map_err(|err| {
                    PipelineError::Merge(format!(
                        "genres for {} are not a JSON string array: {err}",
                        self.artist_ids[i]
                    ))
                })?;
                Ok(DimArtistRow {
                    artist_id: self.artist_ids[i].clone(),
                    artist_name: self.names[i].clone(),
                    artist_popularity: self.popularities[i],
                    artist_genres: genres,
                    artist_uri: self.uris[i].clone(),
                    artist_image_url: self.image_urls[i].clone(),
                    last_seen_snapshot_date: parse_snapshot_date(&self.snapshot_dates[i]),
                })
            })
            .collect()
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// `MAX(snapshot_date)` over the fact table; `None` when it is empty.
    async fn latest_snapshot_date(&self) -> Result<Option<NaiveDate>, PipelineError>;

    /// Distinct non-null primary artist ids referenced on `snapshot_date`.
    async fn referenced_artist_ids(
        &self,
        snapshot_date: NaiveDate,
    ) -> Result<BTreeSet<ArtistId>, PipelineError>;

    /// Distinct non-null ids already in the artist dimension.
    async fn known_artist_ids(&self) -> Result<BTreeSet<ArtistId>, PipelineError>;

    /// Single all-or-nothing upsert keyed by artist id. Returns the number of
    /// rows inserted plus updated.
    async fn merge_artists(
        &self,
        columns: &ArtistColumns,
        policy: LastSeenPolicy,
    ) -> Result<u64, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFact {
    pub track_id: String,
    pub primary_artist_id: Option<ArtistId>,
    pub snapshot_date: NaiveDate,
}

#[derive(Debug, Default)]
struct MemoryState {
    tracks: Vec<TrackFact>,
    artists: BTreeMap<ArtistId, DimArtistRow>,
    merge_calls: Vec<ArtistColumns>,
    fail_merges: bool,
}

/// In-process warehouse with the same merge semantics as the Postgres one.
/// Backs local dry runs and the pipeline tests.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_track(
        &self,
        track_id: &str,
        primary_artist_id: Option<&str>,
        snapshot_date: NaiveDate,
    ) {
        self.state.lock().await.tracks.push(TrackFact {
            track_id: track_id.to_string(),
            primary_artist_id: primary_artist_id.map(ToString::to_string),
            snapshot_date,
        });
    }

    pub async fn insert_artist(&self, row: DimArtistRow) {
        self.state
            .lock()
            .await
            .artists
            .insert(row.artist_id.clone(), row);
    }

    pub async fn artists(&self) -> Vec<DimArtistRow> {
        self.state.lock().await.artists.values().cloned().collect()
    }

    pub async fn artist(&self, artist_id: &str) -> Option<DimArtistRow> {
        self.state.lock().await.artists.get(artist_id).cloned()
    }

    pub async fn merge_calls(&self) -> Vec<ArtistColumns> {
        self.state.lock().await.merge_calls.clone()
    }

    pub async fn set_fail_merges(&self, fail: bool) {
        self.state.lock().await.fail_merges = fail;
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn latest_snapshot_date(&self) -> Result<Option<NaiveDate>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state.tracks.iter().map(|t| t.snapshot_date).max())
    }

    async fn referenced_artist_ids(
        &self,
        snapshot_date: NaiveDate,
    ) -> Result<BTreeSet<ArtistId>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state
            .tracks
            .iter()
            .filter(|t| t.snapshot_date == snapshot_date)
            .filter_map(|t| t.primary_artist_id.clone())
            .collect())
    }

    async fn known_artist_ids(&self) -> Result<BTreeSet<ArtistId>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state.artists.keys().cloned().collect())
    }

    async fn merge_artists(
        &self,
        columns: &ArtistColumns,
        policy: LastSeenPolicy,
    ) -> Result<u64, PipelineError> {
        let mut state = self.state.lock().await;
        state.merge_calls.push(columns.clone());
        if state.fail_merges {
            return Err(PipelineError::Merge("merge rejected by warehouse".to_string()));
        }

        // Validate the whole batch before touching any row.
        let rows = columns.to_rows()?;
        let affected = rows.len() as u64;
        for mut row in rows {
            let current = state
                .artists
                .get(&row.artist_id)
                .and_then(|existing| existing.last_seen_snapshot_date);
            row.last_seen_snapshot_date = policy.resolve(current, row.last_seen_snapshot_date);
            state.artists.insert(row.artist_id.clone(), row);
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn upsert(id: &str, genres: &[&str]) -> ArtistUpsert {
        ArtistUpsert {
            artist_id: id.to_string(),
            name: Some(format!("Artist {id}")),
            popularity: Some(40),
            genres: genres.iter().map(|g| g.to_string()).collect(),
            uri: Some(format!("spotify:artist:{id}")),
            image_url: None,
        }
    }

    #[test]
    fn flatten_renders_iso_dates_and_json_genres() {
        let columns =
            ArtistColumns::flatten(&[upsert("A", &["pop", "rock"]), upsert("B", &[])], date(2024, 1, 15))
                .unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns.genres_json, vec![r#"["pop","rock"]"#.to_string(), "[]".to_string()]);
        assert_eq!(columns.snapshot_dates, vec!["2024-01-15".to_string(); 2]);
    }

    #[test]
    fn misaligned_columns_are_rejected() {
        let mut columns = ArtistColumns::flatten(&[upsert("A", &[])], date(2024, 1, 15)).unwrap();
        columns.uris.push(None);
        let err = columns.ensure_aligned().unwrap_err();
        assert!(matches!(err, PipelineError::Merge(ref msg) if msg.contains("uris")));
    }

    #[test]
    fn unparseable_dates_become_null_instead_of_failing() {
        let mut columns = ArtistColumns::flatten(&[upsert("A", &[])], date(2024, 1, 15)).unwrap();
        columns.snapshot_dates[0] = "2024-02-31".to_string();
        let rows = columns.to_rows().unwrap();
        assert_eq!(rows[0].last_seen_snapshot_date, None);
    }

    #[tokio::test]
    async fn invalid_batch_writes_nothing() {
        let warehouse = MemoryWarehouse::new();
        let mut columns =
            ArtistColumns::flatten(&[upsert("A", &[]), upsert("B", &[])], date(2024, 1, 15)).unwrap();
        columns.genres_json[1] = "not json".to_string();

        let err = warehouse
            .merge_artists(&columns, LastSeenPolicy::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Merge(_)));
        assert!(warehouse.artists().await.is_empty());
    }

    #[tokio::test]
    async fn referenced_ids_are_distinct_non_null_and_date_scoped() {
        let warehouse = MemoryWarehouse::new();
        warehouse.insert_track("t1", Some("A"), date(2024, 3, 1)).await;
        warehouse.insert_track("t2", Some("A"), date(2024, 3, 1)).await;
        warehouse.insert_track("t3", None, date(2024, 3, 1)).await;
        warehouse.insert_track("t4", Some("Z"), date(2024, 2, 1)).await;

        assert_eq!(warehouse.latest_snapshot_date().await.unwrap(), Some(date(2024, 3, 1)));
        let referenced = warehouse.referenced_artist_ids(date(2024, 3, 1)).await.unwrap();
        assert_eq!(referenced.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
    }

    #[test]
    fn keep_latest_never_moves_backwards() {
        let policy = LastSeenPolicy::KeepLatest;
        assert_eq!(policy.resolve(Some(date(2024, 3, 1)), Some(date(2024, 2, 1))), Some(date(2024, 3, 1)));
        assert_eq!(policy.resolve(Some(date(2024, 3, 1)), None), Some(date(2024, 3, 1)));
        assert_eq!(policy.resolve(None, Some(date(2024, 2, 1))), Some(date(2024, 2, 1)));
        assert_eq!(
            LastSeenPolicy::Overwrite.resolve(Some(date(2024, 3, 1)), Some(date(2024, 2, 1))),
            Some(date(2024, 2, 1))
        );
        assert_eq!("keep_latest".parse::<LastSeenPolicy>(), Ok(LastSeenPolicy::KeepLatest));
    }
}
