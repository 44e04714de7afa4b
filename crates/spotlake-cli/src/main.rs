use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spotlake_adapters::{SpotifyClient, TimeRange, TopItemKind, MAX_TOP_ITEMS_LIMIT};
use spotlake_storage::{FileSecretProvider, HttpClientConfig, HttpFetcher};
use spotlake_sync::{run_migrations, AppConfig, IngestTarget, PgWarehouse, Services};
use spotlake_web::authorize::{run_authorize_flow, DEFAULT_CALLBACK_PORT};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "spotlake-cli")]
#[command(about = "Spotlake listening-history pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fill artist dimension gaps for the latest staging snapshot.
    Enrich,
    /// Store a raw listening snapshot in object storage.
    Ingest {
        #[arg(long, default_value = "tracks")]
        kind: TopItemKind,
        #[arg(long, default_value = "short_term")]
        time_range: TimeRange,
        #[arg(long, default_value_t = MAX_TOP_ITEMS_LIMIT)]
        limit: u32,
        /// Snapshot a playlist instead; without a value uses SPOTLAKE_PLAYLIST_ID.
        #[arg(long)]
        playlist: Option<Option<String>>,
    },
    /// Run the HTTP trigger surface.
    Serve,
    /// Apply warehouse schema migrations.
    Migrate,
    /// Provision the user refresh token (one-time, interactive).
    Authorize {
        #[arg(long, default_value_t = DEFAULT_CALLBACK_PORT)]
        port: u16,
        #[arg(long, env = "SPOTLAKE_SECRETS_DIR", default_value = "./secrets")]
        secrets_dir: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SPOTLAKE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let result = run(cli.command.unwrap_or(Commands::Enrich)).await;
    if let Err(err) = &result {
        error!(error = ?err, "command failed");
    }
    result
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Enrich => {
            let services = Services::from_env().await?;
            let outcome = services.enrichment.run_once().await?;
            println!("enrichment complete: {}", outcome.message());
        }
        Commands::Ingest {
            kind,
            time_range,
            limit,
            playlist,
        } => {
            let services = Services::from_env().await?;
            let target = match playlist {
                None => IngestTarget::Top {
                    kind,
                    time_range,
                    limit,
                },
                Some(id) => IngestTarget::Playlist {
                    playlist_id: id
                        .or_else(|| services.config.playlist_id.clone())
                        .context("no playlist id given and SPOTLAKE_PLAYLIST_ID is unset")?,
                },
            };
            let summary = services.ingest.run_once(&target).await?;
            println!(
                "ingest complete: target={} items={} objects={}",
                summary.target_name,
                summary.item_count,
                summary.objects.len()
            );
            for object in &summary.objects {
                println!("  {}/{} ({} bytes, sha256 {})", object.bucket, object.path, object.byte_size, object.content_hash);
            }
        }
        Commands::Serve => {
            spotlake_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = AppConfig::from_env()?;
            let warehouse = PgWarehouse::connect(&config.database_url, config.tables.clone())
                .await
                .context("connecting to the warehouse")?;
            run_migrations(warehouse.pool(), warehouse.tables())
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Authorize { port, secrets_dir } => {
            let secrets = FileSecretProvider::new(secrets_dir);
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(10),
                ..HttpClientConfig::default()
            })?;
            let version = run_authorize_flow(&secrets, &SpotifyClient::new(http), port).await?;
            println!(
                "refresh token stored as version {version} under {}",
                secrets.root().display()
            );
        }
    }
    Ok(())
}
