//! Postgres-backed warehouse.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use spotlake_core::{ArtistId, PipelineError};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::warehouse::{parse_snapshot_date, ArtistColumns, LastSeenPolicy, Warehouse};

/// Fully qualified table locations. Names are validated identifiers (see
/// `config`), so quoting them is enough to splice them into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseTables {
    pub dataset: String,
    pub stg_tracks: String,
    pub dim_artists: String,
}

impl Default for WarehouseTables {
    fn default() -> Self {
        Self {
            dataset: "spotlake".to_string(),
            stg_tracks: "stg_tracks".to_string(),
            dim_artists: "dim_artists".to_string(),
        }
    }
}

impl WarehouseTables {
    pub fn stg_tracks_qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.dataset, self.stg_tracks)
    }

    pub fn dim_artists_qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.dataset, self.dim_artists)
    }
}

/// Builds the positional upsert. Parameters `$1..$7` are parallel arrays;
/// `WITH ORDINALITY` keeps element `i` of every array on the same source row.
pub fn merge_statement(dim_artists: &str, policy: LastSeenPolicy) -> String {
    let last_seen = match policy {
        LastSeenPolicy::Overwrite => "source.last_seen_snapshot_date",
        // GREATEST ignores NULLs, so a missing side never clears the other.
        LastSeenPolicy::KeepLatest => {
            "GREATEST(target.last_seen_snapshot_date, source.last_seen_snapshot_date)"
        }
    };
    format!(
        r#"
        MERGE INTO {dim_artists} AS target
        USING (
            SELECT artist_id,
                   artist_name,
                   artist_popularity,
                   artist_genres::jsonb AS artist_genres,
                   artist_uri,
                   artist_image_url,
                   last_seen_snapshot_date
              FROM UNNEST(
                       $1::text[],
                       $2::text[],
                       $3::bigint[],
                       $4::text[],
                       $5::text[],
                       $6::text[],
                       $7::date[]
                   ) WITH ORDINALITY AS src(
                       artist_id,
                       artist_name,
                       artist_popularity,
                       artist_genres,
                       artist_uri,
                       artist_image_url,
                       last_seen_snapshot_date,
                       position
                   )
             ORDER BY position
        ) AS source
        ON target.artist_id = source.artist_id
        WHEN MATCHED THEN UPDATE SET
            artist_name = source.artist_name,
            artist_popularity = source.artist_popularity,
            artist_genres = source.artist_genres,
            artist_uri = source.artist_uri,
            artist_image_url = source.artist_image_url,
            last_seen_snapshot_date = {last_seen}
        WHEN NOT MATCHED THEN INSERT (
            artist_id,
            artist_name,
            artist_popularity,
            artist_genres,
            artist_uri,
            artist_image_url,
            last_seen_snapshot_date
        ) VALUES (
            source.artist_id,
            source.artist_name,
            source.artist_popularity,
            source.artist_genres,
            source.artist_uri,
            source.artist_image_url,
            source.last_seen_snapshot_date
        )
        "#
    )
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    tables: WarehouseTables,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, tables: WarehouseTables) -> Self {
        Self { pool, tables }
    }

    pub async fn connect(database_url: &str, tables: WarehouseTables) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, tables))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &WarehouseTables {
        &self.tables
    }
}

fn warehouse_error(context: &str) -> impl FnOnce(sqlx::Error) -> PipelineError + '_ {
    move |err| PipelineError::Warehouse(format!("{context}: {err}"))
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn latest_snapshot_date(&self) -> Result<Option<NaiveDate>, PipelineError> {
        let sql = format!(
            "SELECT MAX(track_snapshot_date) AS latest FROM {}",
            self.tables.stg_tracks_qualified()
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(warehouse_error("reading latest snapshot date"))?;
        row.try_get::<Option<NaiveDate>, _>("latest")
            .map_err(warehouse_error("decoding latest snapshot date"))
    }

    async fn referenced_artist_ids(
        &self,
        snapshot_date: NaiveDate,
    ) -> Result<BTreeSet<ArtistId>, PipelineError> {
        let sql = format!(
            r#"
            SELECT DISTINCT primary_artist_id
              FROM {}
             WHERE track_snapshot_date = $1
               AND primary_artist_id IS NOT NULL
            "#,
            self.tables.stg_tracks_qualified()
        );
        let rows = sqlx::query(&sql)
            .bind(snapshot_date)
            .fetch_all(&self.pool)
            .await
            .map_err(warehouse_error("reading referenced artist ids"))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("primary_artist_id"))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(warehouse_error("decoding referenced artist ids"))
    }

    async fn known_artist_ids(&self) -> Result<BTreeSet<ArtistId>, PipelineError> {
        let sql = format!(
            "SELECT DISTINCT artist_id FROM {} WHERE artist_id IS NOT NULL",
            self.tables.dim_artists_qualified()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(warehouse_error("reading known artist ids"))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("artist_id"))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(warehouse_error("decoding known artist ids"))
    }

    async fn merge_artists(
        &self,
        columns: &ArtistColumns,
        policy: LastSeenPolicy,
    ) -> Result<u64, PipelineError> {
        let len = columns.ensure_aligned()?;
        if columns.is_empty() {
            return Ok(0);
        }
        let dates: Vec<Option<NaiveDate>> = columns
            .snapshot_dates
            .iter()
            .map(|value| parse_snapshot_date(value))
            .collect();
        let sql = merge_statement(&self.tables.dim_artists_qualified(), policy);
        debug!(rows = len, ?policy, "executing artist merge");

        let merge_err = |err: sqlx::Error| PipelineError::Merge(err.to_string());
        let mut tx = self.pool.begin().await.map_err(merge_err)?;
        let result = sqlx::query(&sql)
            .bind(&columns.artist_ids)
            .bind(&columns.names)
            .bind(&columns.popularities)
            .bind(&columns.genres_json)
            .bind(&columns.uris)
            .bind(&columns.image_urls)
            .bind(&dates)
            .execute(&mut *tx)
            .await
            .map_err(merge_err)?;
        tx.commit().await.map_err(merge_err)?;

        info!(affected_rows = result.rows_affected(), "artist merge committed");
        Ok(result.rows_affected())
    }
}

/// Idempotent DDL for the configured schema and tables.
pub fn migration_statements(tables: &WarehouseTables) -> Vec<String> {
    let stg_tracks = tables.stg_tracks_qualified();
    let dim_artists = tables.dim_artists_qualified();
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", tables.dataset),
        // One row per track per daily listening snapshot.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {stg_tracks} (
                track_id            TEXT NOT NULL,
                track_name          TEXT,
                track_popularity    BIGINT,
                primary_artist_id   TEXT,
                primary_artist_name TEXT,
                track_snapshot_date DATE NOT NULL,
                PRIMARY KEY (track_id, track_snapshot_date)
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{}_snapshot_date_idx\" ON {stg_tracks} (track_snapshot_date)",
            tables.stg_tracks
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {dim_artists} (
                artist_id               TEXT PRIMARY KEY,
                artist_name             TEXT,
                artist_popularity       BIGINT,
                artist_genres           JSONB NOT NULL DEFAULT '[]'::jsonb,
                artist_uri              TEXT,
                artist_image_url        TEXT,
                last_seen_snapshot_date DATE
            )
            "#
        ),
    ]
}

/// Creates the schema and tables named by `tables` in one transaction.
pub async fn run_migrations(pool: &PgPool, tables: &WarehouseTables) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for statement in migration_statements(tables) {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("applying migration statement: {}", statement.trim()))?;
    }
    tx.commit().await?;
    info!(
        dataset = %tables.dataset,
        stg_tracks = %tables.stg_tracks,
        dim_artists = %tables.dim_artists,
        "warehouse schema is up to date"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_quoted() {
        let tables = WarehouseTables::default();
        assert_eq!(tables.stg_tracks_qualified(), "\"spotlake\".\"stg_tracks\"");
        assert_eq!(tables.dim_artists_qualified(), "\"spotlake\".\"dim_artists\"");
    }

    #[test]
    fn merge_statement_keeps_positions_aligned() {
        let sql = merge_statement("\"spotlake\".\"dim_artists\"", LastSeenPolicy::Overwrite);
        assert!(sql.contains("MERGE INTO \"spotlake\".\"dim_artists\" AS target"));
        assert!(sql.contains("WITH ORDINALITY"));
        assert!(sql.contains("$7::date[]"));
        assert!(sql.contains("artist_genres::jsonb"));
        assert!(sql.contains("ON target.artist_id = source.artist_id"));
        assert!(sql.contains("last_seen_snapshot_date = source.last_seen_snapshot_date"));
        assert!(!sql.contains("GREATEST"));
    }

    #[test]
    fn migrations_follow_the_configured_names() {
        let tables = WarehouseTables {
            dataset: "warehouse".to_string(),
            stg_tracks: "tracks_fact".to_string(),
            dim_artists: "artists_dim".to_string(),
        };
        let ddl = migration_statements(&tables).join("\n");
        assert!(ddl.contains("CREATE SCHEMA IF NOT EXISTS \"warehouse\""));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"warehouse\".\"tracks_fact\""));
        assert!(ddl.contains("ON \"warehouse\".\"tracks_fact\" (track_snapshot_date)"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"warehouse\".\"artists_dim\""));
        assert!(!ddl.contains("spotlake"));
    }

    #[test]
    fn keep_latest_guards_only_the_date() {
        let sql = merge_statement("dim", LastSeenPolicy::KeepLatest);
        assert!(sql.contains(
            "last_seen_snapshot_date = GREATEST(target.last_seen_snapshot_date, source.last_seen_snapshot_date)"
        ));
        assert!(sql.contains("artist_name = source.artist_name"));
    }

    // The tests below need a live Postgres (15+ for MERGE) at DATABASE_URL;
    // each one works in its own throwaway schema and is skipped without it.
    mod live {
        use super::*;
        use std::sync::Arc;

        use crate::enrich::UpsertMerger;
        use crate::test_support::artist;
        use spotlake_core::DimArtistRow;
        use uuid::Uuid;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        async fn migrated_warehouse() -> Option<Arc<PgWarehouse>> {
            let Ok(url) = std::env::var("DATABASE_URL") else {
                eprintln!("DATABASE_URL unset; skipping Postgres test");
                return None;
            };
            let tables = WarehouseTables {
                dataset: format!("spotlake_test_{}", Uuid::new_v4().simple()),
                stg_tracks: "tracks_fact".to_string(),
                dim_artists: "artists_dim".to_string(),
            };
            let warehouse = PgWarehouse::connect(&url, tables).await.unwrap();
            run_migrations(warehouse.pool(), warehouse.tables()).await.unwrap();
            Some(Arc::new(warehouse))
        }

        async fn drop_schema(warehouse: &PgWarehouse) {
            let sql = format!("DROP SCHEMA \"{}\" CASCADE", warehouse.tables().dataset);
            sqlx::query(&sql).execute(warehouse.pool()).await.unwrap();
        }

        async fn insert_track(warehouse: &PgWarehouse, track_id: &str, artist_id: Option<&str>, day: NaiveDate) {
            let sql = format!(
                "INSERT INTO {} (track_id, primary_artist_id, track_snapshot_date) VALUES ($1, $2, $3)",
                warehouse.tables().stg_tracks_qualified()
            );
            sqlx::query(&sql)
                .bind(track_id)
                .bind(artist_id)
                .bind(day)
                .execute(warehouse.pool())
                .await
                .unwrap();
        }

        async fn dimension_rows(warehouse: &PgWarehouse) -> Vec<DimArtistRow> {
            let sql = format!(
                "SELECT * FROM {} ORDER BY artist_id",
                warehouse.tables().dim_artists_qualified()
            );
            let rows = sqlx::query(&sql).fetch_all(warehouse.pool()).await.unwrap();
            rows.iter()
                .map(|row| DimArtistRow {
                    artist_id: row.try_get("artist_id").unwrap(),
                    artist_name: row.try_get("artist_name").unwrap(),
                    artist_popularity: row.try_get("artist_popularity").unwrap(),
                    artist_genres: serde_json::from_value(
                        row.try_get::<serde_json::Value, _>("artist_genres").unwrap(),
                    )
                    .unwrap(),
                    artist_uri: row.try_get("artist_uri").unwrap(),
                    artist_image_url: row.try_get("artist_image_url").unwrap(),
                    last_seen_snapshot_date: row.try_get("last_seen_snapshot_date").unwrap(),
                })
                .collect()
        }

        #[tokio::test]
        async fn migrated_tables_answer_snapshot_queries() {
            let Some(warehouse) = migrated_warehouse().await else { return };
            run_migrations(warehouse.pool(), warehouse.tables()).await.unwrap();
            assert_eq!(warehouse.latest_snapshot_date().await.unwrap(), None);

            insert_track(&warehouse, "t0", Some("Z"), date(2024, 2, 1)).await;
            insert_track(&warehouse, "t1", Some("A"), date(2024, 3, 1)).await;
            insert_track(&warehouse, "t2", Some("A"), date(2024, 3, 1)).await;
            insert_track(&warehouse, "t3", None, date(2024, 3, 1)).await;

            assert_eq!(warehouse.latest_snapshot_date().await.unwrap(), Some(date(2024, 3, 1)));
            let referenced = warehouse.referenced_artist_ids(date(2024, 3, 1)).await.unwrap();
            assert_eq!(referenced.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
            assert!(warehouse.known_artist_ids().await.unwrap().is_empty());

            drop_schema(&warehouse).await;
        }

        #[tokio::test]
        async fn merge_is_positional_and_idempotent() {
            let Some(warehouse) = migrated_warehouse().await else { return };
            let merger = UpsertMerger::new(warehouse.clone(), LastSeenPolicy::Overwrite);
            let mut a = artist("A", "X", &["pop"]);
            a.popularity = Some(5);
            let mut b = artist("B", "Y", &[]);
            b.popularity = None;
            b.images.clear();
            let batch = vec![a, b];

            assert_eq!(merger.merge(&batch, date(2024, 1, 15)).await.unwrap(), 2);
            let first = dimension_rows(&warehouse).await;
            assert_eq!(merger.merge(&batch, date(2024, 1, 15)).await.unwrap(), 2);
            assert_eq!(dimension_rows(&warehouse).await, first);

            assert_eq!(first.len(), 2);
            assert_eq!(first[0].artist_id, "A");
            assert_eq!(first[0].artist_name.as_deref(), Some("X"));
            assert_eq!(first[0].artist_genres, vec!["pop".to_string()]);
            assert_eq!(first[0].artist_popularity, Some(5));
            assert_eq!(first[0].artist_image_url.as_deref(), Some("https://img.example/A.jpg"));
            assert_eq!(first[1].artist_id, "B");
            assert_eq!(first[1].artist_name.as_deref(), Some("Y"));
            assert!(first[1].artist_genres.is_empty());
            assert_eq!(first[1].artist_popularity, None);
            assert_eq!(first[1].artist_image_url, None);
            assert!(first.iter().all(|row| row.last_seen_snapshot_date == Some(date(2024, 1, 15))));
            assert_eq!(
                warehouse.known_artist_ids().await.unwrap().into_iter().collect::<Vec<_>>(),
                vec!["A".to_string(), "B".to_string()]
            );

            drop_schema(&warehouse).await;
        }

        #[tokio::test]
        async fn last_seen_policies_against_an_older_run() {
            let Some(warehouse) = migrated_warehouse().await else { return };
            let overwrite = UpsertMerger::new(warehouse.clone(), LastSeenPolicy::Overwrite);
            let keep_latest = UpsertMerger::new(warehouse.clone(), LastSeenPolicy::KeepLatest);
            overwrite.merge(&[artist("A", "X", &[])], date(2024, 1, 15)).await.unwrap();

            keep_latest.merge(&[artist("A", "Renamed", &[])], date(2023, 1, 1)).await.unwrap();
            let rows = dimension_rows(&warehouse).await;
            assert_eq!(rows[0].last_seen_snapshot_date, Some(date(2024, 1, 15)));
            assert_eq!(rows[0].artist_name.as_deref(), Some("Renamed"));

            overwrite.merge(&[artist("A", "Renamed", &[])], date(2023, 1, 1)).await.unwrap();
            let rows = dimension_rows(&warehouse).await;
            assert_eq!(rows[0].last_seen_snapshot_date, Some(date(2023, 1, 1)));

            drop_schema(&warehouse).await;
        }

        #[tokio::test]
        async fn unparseable_date_is_stored_as_null() {
            let Some(warehouse) = migrated_warehouse().await else { return };
            let upsert = spotlake_core::ArtistUpsert::from_record(&artist("A", "X", &[])).unwrap();
            let mut columns = ArtistColumns::flatten(&[upsert], date(2024, 1, 15)).unwrap();
            columns.snapshot_dates[0] = "2024-02-31".to_string();

            let affected = warehouse
                .merge_artists(&columns, LastSeenPolicy::Overwrite)
                .await
                .unwrap();
            assert_eq!(affected, 1);
            assert_eq!(dimension_rows(&warehouse).await[0].last_seen_snapshot_date, None);
            assert_eq!(
                warehouse
                    .merge_artists(&ArtistColumns::default(), LastSeenPolicy::Overwrite)
                    .await
                    .unwrap(),
                0
            );

            drop_schema(&warehouse).await;
        }
    }
}
