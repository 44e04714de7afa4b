//! One-time OAuth bootstrap that provisions the user refresh token.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use spotlake_adapters::{
    authorization_code_from_callback, authorize_url, ClientCredentials, SpotifyClient,
    TOP_READ_SCOPE,
};
use spotlake_storage::{FileSecretProvider, SecretProvider, LATEST_VERSION};
use spotlake_sync::{CLIENT_ID_SECRET, CLIENT_SECRET_SECRET, REFRESH_TOKEN_SECRET};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_CALLBACK_PORT: u16 = 8000;

type CallbackSender = Arc<Mutex<Option<oneshot::Sender<HashMap<String, String>>>>>;

/// Router that hands the first callback's query parameters to `sender`.
pub fn callback_router(sender: oneshot::Sender<HashMap<String, String>>) -> Router {
    let sender: CallbackSender = Arc::new(Mutex::new(Some(sender)));
    Router::new()
        .route("/callback", get(callback_handler))
        .with_state(sender)
}

async fn callback_handler(
    State(sender): State<CallbackSender>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    match sender.lock().await.take() {
        Some(tx) => {
            let _ = tx.send(params);
            Html("<p>Authorization received. You can close this window.</p>")
        }
        None => Html("<p>Authorization already handled.</p>"),
    }
}

/// Prints the authorize URL, waits for the redirect on
/// `127.0.0.1:<port>/callback`, exchanges the code and stores the refresh
/// token as a new secret version. Returns that version.
pub async fn run_authorize_flow(
    secrets: &FileSecretProvider,
    client: &SpotifyClient,
    port: u16,
) -> anyhow::Result<u64> {
    let client_id = secrets
        .get(CLIENT_ID_SECRET, LATEST_VERSION)
        .await
        .with_context(|| format!("reading {CLIENT_ID_SECRET}"))?;
    let client_secret = secrets
        .get(CLIENT_SECRET_SECRET, LATEST_VERSION)
        .await
        .with_context(|| format!("reading {CLIENT_SECRET_SECRET}"))?;
    let credentials = ClientCredentials::new(client_id, client_secret);

    let state = Uuid::new_v4().simple().to_string();
    let redirect_uri = format!("http://127.0.0.1:{port}/callback");
    let url = authorize_url(&credentials.client_id, &redirect_uri, TOP_READ_SCOPE, &state)?;

    let (tx, rx) = oneshot::channel();
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding callback listener on port {port}"))?;
    let server = tokio::spawn(async move { axum::serve(listener, callback_router(tx)).await });

    println!("Open this URL in a browser to authorize spotlake:\n\n  {url}\n");
    info!(%redirect_uri, "waiting for authorization callback");
    let params = rx.await;
    server.abort();
    let params = params.context("callback listener stopped before a redirect arrived")?;

    let code = authorization_code_from_callback(&params, &state)?;
    let token = client
        .exchange_code(&credentials, &code, &redirect_uri)
        .await
        .context("exchanging authorization code")?;
    let Some(refresh_token) = token.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
        bail!("token endpoint did not return a refresh token");
    };

    let version = secrets.put(REFRESH_TOKEN_SECRET, refresh_token).await?;
    info!(secret = REFRESH_TOKEN_SECRET, version, "stored refresh token");
    Ok(version)
}
