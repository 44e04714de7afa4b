//! Upstream music API adapter: token exchange, artist lookup and raw
//! listening snapshots.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use spotlake_core::ArtistRecord;
use spotlake_storage::{FetchError, FetchedResponse, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "spotlake-adapters";

pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SPOTIFY_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const SPOTIFY_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const TOP_READ_SCOPE: &str = "user-top-read";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8000/callback";
pub const MAX_TOP_ITEMS_LIMIT: u32 = 50;

#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// `Basic base64(client_id:client_secret)`
    pub fn basic_authorization(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Token endpoint response. A rotated `refresh_token` is surfaced but never
/// persisted by the pipelines.
#[derive(Clone, Default, Deserialize)]
pub struct AccessToken {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl AccessToken {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: Some("Bearer".to_string()),
            ..Self::default()
        }
    }

    pub fn secret(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("token request failed: {0}")]
    Transport(#[source] FetchError),
    #[error("token response could not be decoded: {0}")]
    Decode(String),
    #[error("token response did not include an access token")]
    MissingAccessToken,
}

impl AuthError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::Decode(_) | Self::MissingAccessToken => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopItemKind {
    Tracks,
    Artists,
}

impl TopItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tracks => "tracks",
            Self::Artists => "artists",
        }
    }
}

impl FromStr for TopItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracks" => Ok(Self::Tracks),
            "artists" => Ok(Self::Artists),
            other => Err(format!("unknown top item kind {other:?} (expected tracks|artists)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    #[default]
    ShortTerm,
    MediumTerm,
    LongTerm,
}

impl TimeRange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::MediumTerm => "medium_term",
            Self::LongTerm => "long_term",
        }
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short_term" => Ok(Self::ShortTerm),
            "medium_term" => Ok(Self::MediumTerm),
            "long_term" => Ok(Self::LongTerm),
            other => Err(format!(
                "unknown time range {other:?} (expected short_term|medium_term|long_term)"
            )),
        }
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Refresh-token grant for user-scoped endpoints.
    async fn refresh(
        &self,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<AccessToken, AuthError>;

    /// Client-credentials grant for catalog endpoints.
    async fn client_credentials(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, AuthError>;
}

#[async_trait]
pub trait ArtistSource: Send + Sync {
    /// 403/404 resolve to an empty list; other failures are returned as
    /// errors for the caller to classify.
    async fn fetch_artists(
        &self,
        token: &AccessToken,
        ids: &[String],
    ) -> Result<Vec<ArtistRecord>, FetchError>;
}

#[async_trait]
pub trait ListeningSource: Send + Sync {
    async fn fetch_top_items(
        &self,
        token: &AccessToken,
        kind: TopItemKind,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<JsonValue, FetchError>;

    async fn fetch_playlist(
        &self,
        token: &AccessToken,
        playlist_id: &str,
    ) -> Result<JsonValue, FetchError>;
}

/// Drops empty identifiers and duplicates, keeping first-seen order.
pub fn prepare_artist_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Deserialize)]
struct ArtistsEnvelope {
    #[serde(default)]
    artists: Option<Vec<Option<ArtistRecord>>>,
}

fn decode_json<T: DeserializeOwned>(response: &FetchedResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&response.body).map_err(|err| FetchError::Decode {
        url: response.final_url.clone(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct SpotifyClient {
    http: HttpFetcher,
    token_url: String,
    api_base: String,
}

impl SpotifyClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_endpoints(http, SPOTIFY_TOKEN_URL, SPOTIFY_API_BASE_URL)
    }

    pub fn with_endpoints(
        http: HttpFetcher,
        token_url: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn token_request(
        &self,
        credentials: &ClientCredentials,
        form: &[(&str, &str)],
    ) -> Result<AccessToken, AuthError> {
        let request = self
            .http
            .client()
            .post(&self.token_url)
            .header(AUTHORIZATION, credentials.basic_authorization())
            .form(form);
        let response = self
            .http
            .execute("token", request)
            .await
            .map_err(AuthError::Transport)?;

        if !response.is_success() {
            let status = response.status.as_u16();
            let body = response.body_text();
            warn!(status, body = %body, "token exchange rejected");
            return Err(AuthError::Status { status, body });
        }

        let token: AccessToken = serde_json::from_slice(&response.body)
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        if token.access_token.is_empty() {
            return Err(AuthError::MissingAccessToken);
        }
        Ok(token)
    }

    /// Authorization-code grant used once to provision a refresh token.
    pub async fn exchange_code(
        &self,
        credentials: &ClientCredentials,
        code: &str,
        redirect_uri: &str,
    ) -> Result<AccessToken, AuthError> {
        self.token_request(
            credentials,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    async fn get_json(
        &self,
        label: &str,
        token: &AccessToken,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let request = self
            .http
            .client()
            .get(&url)
            .bearer_auth(token.secret())
            .query(query);
        let response = self.http.execute(label, request).await?.error_for_status()?;
        decode_json(&response)
    }
}

#[async_trait]
impl TokenSource for SpotifyClient {
    async fn refresh(
        &self,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<AccessToken, AuthError> {
        let token = self
            .token_request(
                credentials,
                &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
            )
            .await?;
        if token.refresh_token.is_some() {
            debug!("token endpoint rotated the refresh token; keeping the stored one");
        }
        info!(expires_in = ?token.expires_in, "refreshed upstream access token");
        Ok(token)
    }

    async fn client_credentials(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, AuthError> {
        let token = self
            .token_request(credentials, &[("grant_type", "client_credentials")])
            .await?;
        info!(expires_in = ?token.expires_in, "obtained client-credentials access token");
        Ok(token)
    }
}

#[async_trait]
impl ArtistSource for SpotifyClient {
    async fn fetch_artists(
        &self,
        token: &AccessToken,
        ids: &[String],
    ) -> Result<Vec<ArtistRecord>, FetchError> {
        let ids = prepare_artist_ids(ids);
        if ids.is_empty() {
            info!("no valid artist ids to fetch");
            return Ok(Vec::new());
        }

        let request = self
            .http
            .client()
            .get(format!("{}/artists", self.api_base))
            .bearer_auth(token.secret())
            .query(&[("ids", ids.join(","))]);
        let response = self.http.execute("artists", request).await?;

        if matches!(response.status, StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
            warn!(
                status = response.status.as_u16(),
                requested = ids.len(),
                "artist lookup refused; treating as no results"
            );
            return Ok(Vec::new());
        }

        let response = response.error_for_status()?;
        let envelope: ArtistsEnvelope = decode_json(&response)?;
        let Some(artists) = envelope.artists else {
            warn!("artist lookup response has no artists key");
            return Ok(Vec::new());
        };

        let fetched: Vec<ArtistRecord> = artists.into_iter().flatten().collect();
        info!(
            requested = ids.len(),
            fetched = fetched.len(),
            "fetched artist details"
        );
        Ok(fetched)
    }
}

#[async_trait]
impl ListeningSource for SpotifyClient {
    async fn fetch_top_items(
        &self,
        token: &AccessToken,
        kind: TopItemKind,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<JsonValue, FetchError> {
        self.get_json(
            "top_items",
            token,
            &format!("me/top/{}", kind.as_str()),
            &[
                ("time_range", time_range.as_str().to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn fetch_playlist(
        &self,
        token: &AccessToken,
        playlist_id: &str,
    ) -> Result<JsonValue, FetchError> {
        self.get_json("playlist", token, &format!("playlists/{playlist_id}"), &[])
            .await
    }
}

/// URL the user opens once to grant the pipeline a refresh token.
pub fn authorize_url(
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
) -> anyhow::Result<Url> {
    Url::parse_with_params(
        SPOTIFY_AUTHORIZE_URL,
        &[
            ("client_id", client_id),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("scope", scope),
            ("state", state),
        ],
    )
    .context("building authorize url")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("state mismatch on authorization callback")]
    StateMismatch,
    #[error("authorization failed: {0}")]
    Denied(String),
    #[error("authorization callback carried no code")]
    MissingCode,
}

/// Validates the redirect query parameters and extracts the code.
pub fn authorization_code_from_callback(
    params: &HashMap<String, String>,
    expected_state: &str,
) -> Result<String, CallbackError> {
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(CallbackError::StateMismatch);
    }
    if let Some(code) = params.get("code").filter(|c| !c.is_empty()) {
        return Ok(code.clone());
    }
    match params.get("error") {
        Some(error) => Err(CallbackError::Denied(error.clone())),
        None => Err(CallbackError::MissingCode),
    }
}
