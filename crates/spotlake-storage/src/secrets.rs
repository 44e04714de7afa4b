//! Named, versioned secret lookup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const LATEST_VERSION: &str = "latest";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {name} version {version} not found")]
    NotFound { name: String, version: String },
    #[error("invalid secret name {0:?}")]
    InvalidName(String),
    #[error("secret {name} is not valid UTF-8")]
    NotUtf8 { name: String },
    #[error("reading secret {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only secret lookup by name and version (`"latest"` or a number).
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get(&self, name: &str, version: &str) -> Result<String, SecretError>;
}

fn validate_name(name: &str) -> Result<(), SecretError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SecretError::InvalidName(name.to_string()))
    }
}

fn trim_secret(value: String) -> String {
    value.trim_end_matches(['\n', '\r']).to_string()
}

/// Directory-backed secret store laid out as `<root>/<name>/<version>`.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    root: PathBuf,
}

impl FileSecretProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn latest_version(&self, name: &str) -> Result<Option<u64>, SecretError> {
        let dir = self.root.join(name);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SecretError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        };

        let mut latest = None;
        loop {
            let entry = entries.next_entry().await.map_err(|source| SecretError::Io {
                name: name.to_string(),
                source,
            })?;
            let Some(entry) = entry else { break };
            if let Some(version) = entry.file_name().to_str().and_then(|v| v.parse::<u64>().ok()) {
                latest = latest.max(Some(version));
            }
        }
        Ok(latest)
    }

    /// Adds a new version of `name` and returns its number.
    pub async fn put(&self, name: &str, value: &str) -> Result<u64, SecretError> {
        validate_name(name)?;
        let io_err = |source: std::io::Error| SecretError::Io {
            name: name.to_string(),
            source,
        };
        let version = self.latest_version(name).await?.map_or(1, |v| v + 1);
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).await.map_err(io_err)?;

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await.map_err(io_err)?;
        file.write_all(value.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);
        fs::rename(&temp_path, dir.join(version.to_string()))
            .await
            .map_err(io_err)?;

        info!(secret = name, version, "stored new secret version");
        Ok(version)
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get(&self, name: &str, version: &str) -> Result<String, SecretError> {
        validate_name(name)?;
        let not_found = || SecretError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        };

        let resolved = if version == LATEST_VERSION {
            self.latest_version(name).await?.ok_or_else(not_found)?
        } else {
            version.parse::<u64>().map_err(|_| not_found())?
        };

        let path = self.root.join(name).join(resolved.to_string());
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(source) => {
                return Err(SecretError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        };
        let value = String::from_utf8(bytes).map_err(|_| SecretError::NotUtf8 {
            name: name.to_string(),
        })?;

        debug!(secret = name, version = resolved, "accessed secret");
        Ok(trim_secret(value))
    }
}

/// Resolves `name` from `SPOTLAKE_SECRET_<NAME>`; only `latest` exists.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn variable_name(name: &str) -> String {
        format!(
            "SPOTLAKE_SECRET_{}",
            name.to_ascii_uppercase().replace('-', "_")
        )
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get(&self, name: &str, version: &str) -> Result<String, SecretError> {
        validate_name(name)?;
        let not_found = || SecretError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        };
        if version != LATEST_VERSION {
            return Err(not_found());
        }
        std::env::var(Self::variable_name(name))
            .map(trim_secret)
            .map_err(|_| not_found())
    }
}
