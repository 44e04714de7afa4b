//! HTTP trigger surface: one stateless entry point per pipeline.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use spotlake_adapters::{TimeRange, TopItemKind, MAX_TOP_ITEMS_LIMIT};
use spotlake_core::PipelineError;
use spotlake_sync::{EnrichmentPipeline, IngestPipeline, IngestTarget, Services};
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod authorize;

pub const CRATE_NAME: &str = "spotlake-web";

#[derive(Clone)]
pub struct AppState {
    pub enrichment: Arc<EnrichmentPipeline>,
    pub ingest: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(enrichment: Arc<EnrichmentPipeline>, ingest: Arc<IngestPipeline>) -> Self {
        Self { enrichment, ingest }
    }

    pub fn from_services(services: &Services) -> Self {
        Self::new(services.enrichment.clone(), services.ingest.clone())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct IngestQuery {
    pub kind: Option<TopItemKind>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<u32>,
    pub playlist_id: Option<String>,
}

impl IngestQuery {
    /// A playlist id selects a playlist snapshot; otherwise top items.
    pub fn target(&self) -> IngestTarget {
        match &self.playlist_id {
            Some(playlist_id) => IngestTarget::Playlist {
                playlist_id: playlist_id.clone(),
            },
            None => IngestTarget::Top {
                kind: self.kind.unwrap_or(TopItemKind::Tracks),
                time_range: self.time_range.unwrap_or_default(),
                limit: self.limit.unwrap_or(MAX_TOP_ITEMS_LIMIT),
            },
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/enrich", get(enrich_handler).post(enrich_handler))
        .route("/ingest", get(ingest_handler).post(ingest_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: &Services) -> anyhow::Result<()> {
    let port = services.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger surface listening");
    axum::serve(listener, app(AppState::from_services(services))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let services = Services::from_env().await?;
    serve(&services).await
}

async fn enrich_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.enrichment.run_once().await {
        Ok(outcome) => (StatusCode::OK, outcome.response_text()).into_response(),
        Err(err) => pipeline_error("enrichment", err),
    }
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IngestQuery>,
) -> Response {
    match state.ingest.run_once(&query.target()).await {
        Ok(summary) => {
            info!(ingest_target = %summary.target_name, objects = summary.objects.len(), "ingest triggered");
            (StatusCode::OK, "OK").into_response()
        }
        Err(err) => pipeline_error("ingest", err),
    }
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

fn pipeline_error(pipeline: &str, err: PipelineError) -> Response {
    error!(pipeline, error = %err, fatal = err.is_fatal(), "pipeline run failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Error: {err}"),
    )
        .into_response()
}
