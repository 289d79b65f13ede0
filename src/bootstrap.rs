//! Configuration bootstrapper
//!
//! Resolves database configuration cache-first: the local encrypted cache is
//! tried before the remote source. Each attempt decrypts, layers explicit
//! overrides on top, and pings the live store. A remote success rewrites
//! the cache with the fetched ciphertext.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::crypto::{self, EncryptedBlob};
use crate::error::{TelemetryError, TelemetryResult};
use crate::store::StoreConnector;

/// Where the encrypted configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    Http(String),
    File(PathBuf),
}

impl BlobSource {
    /// `http(s)://` locations are fetched, anything else is read from disk
    pub fn from_location(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            BlobSource::Http(location.to_string())
        } else {
            BlobSource::File(PathBuf::from(location))
        }
    }

    pub async fn fetch(&self) -> TelemetryResult<EncryptedBlob> {
        match self {
            BlobSource::Http(url) => {
                let text = reqwest::get(url).await?
                    .error_for_status()?
                    .text()
                    .await?;
                EncryptedBlob::from_json(&text)
            }
            BlobSource::File(path) => {
                let text = tokio::fs::read_to_string(path).await?;
                EncryptedBlob::from_json(&text)
            }
        }
    }
}

impl std::fmt::Display for BlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobSource::Http(url) => write!(f, "{}", url),
            BlobSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Cache,
    Remote,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Cache => write!(f, "cache"),
            ConfigSource::Remote => write!(f, "remote"),
        }
    }
}

/// A validated configuration and where it came from
#[derive(Debug, Clone)]
pub struct Bootstrapped {
    pub config: DbConfig,
    pub source: ConfigSource,
}

/// Every source failed; each attempt keeps its cause
#[derive(Debug, thiserror::Error)]
#[error("configuration bootstrap failed: {}", summarize(.attempts))]
pub struct BootstrapError {
    pub attempts: Vec<(ConfigSource, TelemetryError)>,
}

fn summarize(attempts: &[(ConfigSource, TelemetryError)]) -> String {
    attempts
        .iter()
        .map(|(source, e)| format!("{}: {}", source, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Bootstrapper {
    cache_file: PathBuf,
    remote: Option<BlobSource>,
    password: String,
    overrides: DbConfig,
    connector: Arc<dyn StoreConnector>,
}

impl Bootstrapper {
    pub fn new(cache_file: PathBuf, password: impl Into<String>, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            cache_file,
            remote: None,
            password: password.into(),
            overrides: DbConfig::default(),
            connector,
        }
    }

    pub fn with_remote(mut self, remote: BlobSource) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Values that always win over decrypted ones
    pub fn with_overrides(mut self, overrides: DbConfig) -> Self {
        self.overrides = overrides;
        self
    }

    /// Run the cache-first fallback chain
    pub async fn run(&self) -> Result<Bootstrapped, BootstrapError> {
        let mut attempts = Vec::new();

        if self.cache_file.exists() {
            match self.try_cache().await {
                Ok(config) => {
                    info!("Database configuration loaded from cache {}", self.cache_file.display());
                    return Ok(Bootstrapped { config, source: ConfigSource::Cache });
                }
                Err(e) => {
                    warn!("Cached configuration unusable, trying remote: {}", e);
                    attempts.push((ConfigSource::Cache, e));
                }
            }
        } else {
            debug!("No configuration cache at {}", self.cache_file.display());
        }

        match self.try_remote().await {
            Ok(config) => {
                info!("Database configuration loaded from remote source");
                Ok(Bootstrapped { config, source: ConfigSource::Remote })
            }
            Err(e) => {
                warn!("Remote configuration unusable: {}", e);
                attempts.push((ConfigSource::Remote, e));
                Err(BootstrapError { attempts })
            }
        }
    }

    /// Boolean view of [`Bootstrapper::run`]
    pub async fn succeeded(&self) -> bool {
        self.run().await.is_ok()
    }

    async fn try_cache(&self) -> TelemetryResult<DbConfig> {
        let blob = EncryptedBlob::read_from(&self.cache_file)?;
        self.validate(&blob).await
    }

    async fn try_remote(&self) -> TelemetryResult<DbConfig> {
        let remote = self.remote.as_ref()
            .ok_or_else(|| TelemetryError::invalid("no remote configuration source"))?;

        let blob = remote.fetch().await?;
        let config = self.validate(&blob).await?;

        // The cache only ever holds ciphertext
        if let Err(e) = blob.write_to(&self.cache_file) {
            warn!("Could not refresh configuration cache {}: {}", self.cache_file.display(), e);
        }

        Ok(config)
    }

    /// Decrypt into a fresh config and confirm the store accepts it
    async fn validate(&self, blob: &EncryptedBlob) -> TelemetryResult<DbConfig> {
        let fetched: DbConfig = crypto::decrypt(blob, &self.password)?;
        let config = self.overrides.clone().merged_over(fetched);

        let endpoint = config.endpoint(false)?;
        let store = self.connector.connect(&endpoint).await?;
        store.ping().await?;

        Ok(config)
    }
}
