//! Artist enrichment: detect dimension gaps for the latest snapshot, fetch
//! the missing artists upstream and merge them into the dimension table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use spotlake_adapters::{ArtistSource, TokenSource};
use spotlake_core::{ArtistId, ArtistRecord, ArtistUpsert, PipelineError};
use spotlake_storage::SecretProvider;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::warehouse::{ArtistColumns, LastSeenPolicy, Warehouse};
use crate::{auth_error, load_client_credentials, read_secret, REFRESH_TOKEN_SECRET};

/// Ids referenced by facts but absent from the dimension.
pub fn missing_artist_ids(
    referenced: &BTreeSet<ArtistId>,
    known: &BTreeSet<ArtistId>,
) -> BTreeSet<ArtistId> {
    referenced.difference(known).cloned().collect()
}

/// Terminal state of one enrichment pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    NoData,
    NoArtists {
        snapshot_date: NaiveDate,
    },
    NoGap {
        snapshot_date: NaiveDate,
        referenced: usize,
    },
    NothingFetched {
        snapshot_date: NaiveDate,
        requested: usize,
    },
    Merged {
        snapshot_date: NaiveDate,
        requested: usize,
        fetched: usize,
        affected_rows: u64,
    },
}

impl EnrichmentOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::NoData => "No data in staging".to_string(),
            Self::NoArtists { snapshot_date } => {
                format!("No artists found in tracks for snapshot {snapshot_date}")
            }
            Self::NoGap {
                snapshot_date,
                referenced,
            } => format!("All {referenced} referenced artists for {snapshot_date} already known"),
            Self::NothingFetched {
                snapshot_date,
                requested,
            } => format!("Fetched no artists for {requested} missing ids on {snapshot_date}"),
            Self::Merged {
                snapshot_date,
                requested,
                fetched,
                affected_rows,
            } => format!(
                "Merged {affected_rows} rows ({fetched} of {requested} missing artists fetched) for {snapshot_date}"
            ),
        }
    }

    /// Body of the 200 response on the trigger surface.
    pub fn response_text(&self) -> &'static str {
        match self {
            Self::NoData => "No data in staging",
            Self::NoArtists { .. } => "No artists found in tracks",
            Self::NoGap { .. } | Self::NothingFetched { .. } | Self::Merged { .. } => "OK",
        }
    }
}

/// Prepares fetched records and hands one ordered batch to the warehouse.
#[derive(Clone)]
pub struct UpsertMerger {
    warehouse: Arc<dyn Warehouse>,
    policy: LastSeenPolicy,
}

impl UpsertMerger {
    pub fn new(warehouse: Arc<dyn Warehouse>, policy: LastSeenPolicy) -> Self {
        Self { warehouse, policy }
    }

    /// Records without an id are skipped; a repeated id keeps its last
    /// occurrence in the position of its first. Returns 0 without touching
    /// storage when nothing valid remains.
    pub async fn merge(
        &self,
        records: &[ArtistRecord],
        snapshot_date: NaiveDate,
    ) -> Result<u64, PipelineError> {
        let mut positions: BTreeMap<ArtistId, usize> = BTreeMap::new();
        let mut rows: Vec<ArtistUpsert> = Vec::with_capacity(records.len());
        for row in records.iter().filter_map(ArtistUpsert::from_record) {
            match positions.get(&row.artist_id) {
                Some(&index) => rows[index] = row,
                None => {
                    positions.insert(row.artist_id.clone(), rows.len());
                    rows.push(row);
                }
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = ArtistColumns::flatten(&rows, snapshot_date)?;
        self.warehouse.merge_artists(&columns, self.policy).await
    }
}

pub struct EnrichmentPipeline {
    warehouse: Arc<dyn Warehouse>,
    secrets: Arc<dyn SecretProvider>,
    tokens: Arc<dyn TokenSource>,
    artists: Arc<dyn ArtistSource>,
    merger: UpsertMerger,
}

impl EnrichmentPipeline {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        secrets: Arc<dyn SecretProvider>,
        tokens: Arc<dyn TokenSource>,
        artists: Arc<dyn ArtistSource>,
        policy: LastSeenPolicy,
    ) -> Self {
        let merger = UpsertMerger::new(warehouse.clone(), policy);
        Self {
            warehouse,
            secrets,
            tokens,
            artists,
            merger,
        }
    }

    /// One complete reconciliation pass from a fresh start.
    pub async fn run_once(&self) -> Result<EnrichmentOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("enrichment_run", %run_id);
        async {
            let outcome = self.reconcile().await?;
            info!(outcome = %outcome.message(), "enrichment pass finished");
            Ok::<_, PipelineError>(outcome)
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self) -> Result<EnrichmentOutcome, PipelineError> {
        let Some(snapshot_date) = self.warehouse.latest_snapshot_date().await? else {
            info!("staging fact table is empty");
            return Ok(EnrichmentOutcome::NoData);
        };

        let referenced = self.warehouse.referenced_artist_ids(snapshot_date).await?;
        if referenced.is_empty() {
            info!(%snapshot_date, "no artists referenced by latest snapshot");
            return Ok(EnrichmentOutcome::NoArtists { snapshot_date });
        }

        let known = self.warehouse.known_artist_ids().await?;
        let missing = missing_artist_ids(&referenced, &known);
        info!(
            %snapshot_date,
            referenced = referenced.len(),
            known = known.len(),
            gap = missing.len(),
            "computed artist dimension gap"
        );
        if missing.is_empty() {
            return Ok(EnrichmentOutcome::NoGap {
                snapshot_date,
                referenced: referenced.len(),
            });
        }

        let credentials = load_client_credentials(self.secrets.as_ref()).await?;
        let refresh_token = read_secret(self.secrets.as_ref(), REFRESH_TOKEN_SECRET).await?;
        let token = self
            .tokens
            .refresh(&credentials, &refresh_token)
            .await
            .map_err(auth_error)?;

        let ids: Vec<ArtistId> = missing.into_iter().collect();
        let requested = ids.len();
        let fetched = match self.artists.fetch_artists(&token, &ids).await {
            Ok(records) => records,
            Err(err) => {
                let err = PipelineError::UpstreamFetch(err.to_string());
                warn!(error = %err, requested, "artist fetch failed; treating as empty");
                Vec::new()
            }
        };
        if fetched.is_empty() {
            return Ok(EnrichmentOutcome::NothingFetched {
                snapshot_date,
                requested,
            });
        }

        let affected_rows = self.merger.merge(&fetched, snapshot_date).await?;
        info!(%snapshot_date, fetched = fetched.len(), affected_rows, "merged artists");
        Ok(EnrichmentOutcome::Merged {
            snapshot_date,
            requested,
            fetched: fetched.len(),
            affected_rows,
        })
    }
}
