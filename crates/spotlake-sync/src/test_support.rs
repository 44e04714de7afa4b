use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use spotlake_adapters::{
    prepare_artist_ids, AccessToken, ArtistSource, AuthError, ClientCredentials, ListeningSource,
    TimeRange, TokenSource, TopItemKind,
};
use spotlake_core::{ArtistImage, ArtistRecord};
use spotlake_storage::{FetchError, SecretError, SecretProvider};
use tokio::sync::Mutex;

use crate::{CLIENT_ID_SECRET, CLIENT_SECRET_SECRET, REFRESH_TOKEN_SECRET};

pub fn artist(id: &str, name: &str, genres: &[&str]) -> ArtistRecord {
    ArtistRecord {
        id: Some(id.to_string()),
        name: Some(name.to_string()),
        popularity: Some(55),
        genres: genres.iter().map(|g| g.to_string()).collect(),
        uri: Some(format!("spotify:artist:{id}")),
        images: vec![ArtistImage {
            url: Some(format!("https://img.example/{id}.jpg")),
            height: Some(640),
            width: Some(640),
        }],
    }
}

/// Secret store backed by a map; counts every lookup.
#[derive(Debug, Default)]
pub struct MapSecrets {
    values: HashMap<String, String>,
    lookups: AtomicUsize,
}

impl MapSecrets {
    pub fn with_spotify_credentials() -> Self {
        let mut secrets = Self::default();
        secrets.insert(CLIENT_ID_SECRET, "client-id");
        secrets.insert(CLIENT_SECRET_SECRET, "client-secret");
        secrets.insert(REFRESH_TOKEN_SECRET, "refresh-token");
        secrets
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    pub fn remove(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for MapSecrets {
    async fn get(&self, name: &str, version: &str) -> Result<String, SecretError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.values.get(name).cloned().ok_or_else(|| SecretError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtistFailure {
    /// Adapter-level soft failure: the real client maps 403/404 to empty.
    SoftEmpty,
    Status(u16),
}

#[derive(Debug, Default)]
struct FakeState {
    requested_ids: Vec<Vec<String>>,
    top_requests: Vec<(TopItemKind, TimeRange, u32)>,
    playlist_requests: Vec<String>,
}

/// In-memory upstream API. Unknown ids come back as `null` entries and are
/// dropped, like the real `/artists` endpoint.
#[derive(Debug, Default)]
pub struct FakeSpotify {
    pub catalog: HashMap<String, ArtistRecord>,
    pub fail_auth: bool,
    pub artist_failure: Option<ArtistFailure>,
    pub listening_payload: Option<JsonValue>,
    token_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    state: Mutex<FakeState>,
}

impl FakeSpotify {
    pub fn with_catalog(records: Vec<ArtistRecord>) -> Self {
        Self {
            catalog: records
                .into_iter()
                .filter_map(|r| r.id.clone().map(|id| (id, r)))
                .collect(),
            ..Self::default()
        }
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub async fn requested_ids(&self) -> Vec<Vec<String>> {
        self.state.lock().await.requested_ids.clone()
    }

    pub async fn top_requests(&self) -> Vec<(TopItemKind, TimeRange, u32)> {
        self.state.lock().await.top_requests.clone()
    }

    pub async fn playlist_requests(&self) -> Vec<String> {
        self.state.lock().await.playlist_requests.clone()
    }

    fn issue_token(&self, access_token: &str) -> Result<AccessToken, AuthError> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_auth {
            return Err(AuthError::Status {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.to_string(),
            });
        }
        Ok(AccessToken::bearer(access_token))
    }

    fn listening_payload(&self) -> JsonValue {
        self.listening_payload
            .clone()
            .unwrap_or_else(|| json!({ "items": [] }))
    }
}

#[async_trait]
impl TokenSource for FakeSpotify {
    async fn refresh(
        &self,
        _credentials: &ClientCredentials,
        _refresh_token: &str,
    ) -> Result<AccessToken, AuthError> {
        self.issue_token("user-token")
    }

    async fn client_credentials(
        &self,
        _credentials: &ClientCredentials,
    ) -> Result<AccessToken, AuthError> {
        self.issue_token("app-token")
    }
}

#[async_trait]
impl ArtistSource for FakeSpotify {
    async fn fetch_artists(
        &self,
        _token: &AccessToken,
        ids: &[String],
    ) -> Result<Vec<ArtistRecord>, FetchError> {
        let ids = prepare_artist_ids(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().await.requested_ids.push(ids.clone());

        match self.artist_failure {
            Some(ArtistFailure::SoftEmpty) => return Ok(Vec::new()),
            Some(ArtistFailure::Status(status)) => {
                return Err(FetchError::HttpStatus {
                    status,
                    url: "https://api.spotify.test/v1/artists".to_string(),
                    body: "upstream unavailable".to_string(),
                })
            }
            None => {}
        }
        Ok(ids.iter().filter_map(|id| self.catalog.get(id).cloned()).collect())
    }
}

#[async_trait]
impl ListeningSource for FakeSpotify {
    async fn fetch_top_items(
        &self,
        _token: &AccessToken,
        kind: TopItemKind,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<JsonValue, FetchError> {
        self.state.lock().await.top_requests.push((kind, time_range, limit));
        Ok(self.listening_payload())
    }

    async fn fetch_playlist(
        &self,
        _token: &AccessToken,
        playlist_id: &str,
    ) -> Result<JsonValue, FetchError> {
        self.state
            .lock()
            .await
            .playlist_requests
            .push(playlist_id.to_string());
        Ok(self.listening_payload())
    }
}
