//! Configuration management
//!
//! Two layers live here: the `Settings` file that describes where things are
//! (cache file, remote source, log directory, server address), and the
//! `DbConfig` holding database coordinates, which is decrypted at startup and
//! passed explicitly to every component that needs it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TelemetryError, TelemetryResult};
use crate::normalize::NormalizeOptions;
use crate::store::Endpoint;

pub const ENV_URL: &str = "MONGO_URL";
pub const ENV_URL_SERVER: &str = "MONGO_URL_SERVER";
pub const ENV_USER: &str = "MONGO_USER";
pub const ENV_PASSWORD: &str = "MONGO_PASSWORD";
pub const ENV_BASE: &str = "MONGO_BASE";

/// Environment variable holding the configuration password
pub const ENV_KEY: &str = "LEARNTRACK_PASSWORD";
/// Environment variable forcing the execution context (`local` or `server`)
pub const ENV_CONTEXT: &str = "LEARNTRACK_CONTEXT";

/// Database coordinates, keyed by their environment-variable names when serialized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(rename = "MONGO_URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "MONGO_URL_SERVER", default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(rename = "MONGO_USER", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "MONGO_PASSWORD", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "MONGO_BASE", default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

impl DbConfig {
    /// Read explicit overrides from the process environment.
    ///
    /// The environment is only read, never written.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            url: var(ENV_URL),
            server_url: var(ENV_URL_SERVER),
            user: var(ENV_USER),
            password: var(ENV_PASSWORD),
            base: var(ENV_BASE),
        }
    }

    /// Layer `self` over `fetched`: values set here win, gaps are filled from `fetched`
    pub fn merged_over(self, fetched: DbConfig) -> DbConfig {
        DbConfig {
            url: self.url.or(fetched.url),
            server_url: self.server_url.or(fetched.server_url),
            user: self.user.or(fetched.user),
            password: self.password.or(fetched.password),
            base: self.base.or(fetched.base),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == DbConfig::default()
    }

    /// Build the endpoint for the default URL, or the server URL when asked for it
    pub fn endpoint(&self, server: bool) -> TelemetryResult<Endpoint> {
        let url = if server {
            self.server_url.as_ref()
                .ok_or_else(|| TelemetryError::invalid(format!("{} is not configured", ENV_URL_SERVER)))?
        } else {
            self.url.as_ref()
                .ok_or_else(|| TelemetryError::invalid(format!("{} is not configured", ENV_URL)))?
        };
        let database = self.base.as_ref()
            .ok_or_else(|| TelemetryError::invalid(format!("{} is not configured", ENV_BASE)))?;

        Ok(Endpoint {
            url: url.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            database: database.clone(),
        })
    }
}

/// Where the tracked application is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// Developer machine; the server URL is never tried
    Local,
    #[default]
    Server,
}

impl ExecutionContext {
    /// Resolve the context, letting `LEARNTRACK_CONTEXT` override the configured one
    pub fn detect(configured: ExecutionContext) -> Self {
        Self::resolve(configured, std::env::var(ENV_CONTEXT).ok().as_deref())
    }

    /// Apply an override value; anything other than `local` or `server` is ignored
    pub fn resolve(configured: ExecutionContext, value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("local") => ExecutionContext::Local,
            Some("server") => ExecutionContext::Server,
            _ => configured,
        }
    }
}

/// Main settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
    #[serde(default)]
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Collection receiving event records
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_collection() -> String {
    "events".to_string()
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            collection: default_collection(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapSettings {
    /// Encrypted configuration cache (defaults to `<data dir>/config.enc`)
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
    /// URL or path serving the encrypted configuration
    #[serde(default)]
    pub remote_source: Option<String>,
}

impl BootstrapSettings {
    pub fn cache_file(&self) -> Result<PathBuf> {
        match &self.cache_file {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("config.enc")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// Preferred directory for session artifacts; a per-session temp dir is used if unusable
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Remove the log directory once drained
    #[serde(default = "default_true")]
    pub remove_dir: bool,
    #[serde(default = "default_true")]
    pub include_errors: bool,
    #[serde(default)]
    pub include_outputs: bool,
    /// Version recorded on every event
    #[serde(default = "default_version")]
    pub version: String,
    /// Seconds before an idle process exits after a quit; -1 disables the check
    #[serde(default = "default_quit_delay")]
    pub quit_delay_secs: i64,
    #[serde(default)]
    pub context: ExecutionContext,
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_quit_delay() -> i64 {
    60
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            log_dir: None,
            remove_dir: true,
            include_errors: true,
            include_outputs: false,
            version: default_version(),
            quit_delay_secs: default_quit_delay(),
            context: ExecutionContext::default(),
        }
    }
}

impl TrackingSettings {
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            version: self.version.clone(),
            include_errors: self.include_errors,
            include_outputs: self.include_outputs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Settings {
    /// Load settings from the default location, writing defaults if absent
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let settings = Settings::default();
            settings.save_to(&path)?;
            Ok(settings)
        }
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Save settings to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize settings")?;

        std::fs::write(path, contents)
            .context("Failed to write settings file")?;

        Ok(())
    }
}

/// Get the settings file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("org", "learntrack", "learntrack")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("org", "learntrack", "learntrack")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Print the current settings
pub fn show_settings(settings: &Settings) -> Result<()> {
    let cache = settings.bootstrap.cache_file()?;

    println!("Settings:");
    println!("  collection:       {}", settings.database.collection);
    println!("  cache file:       {}", cache.display());
    println!("  remote source:    {}", settings.bootstrap.remote_source.as_deref().unwrap_or("(none)"));
    println!("  log dir:          {}", settings.tracking.log_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(per-session temp dir)".to_string()));
    println!("  remove dir:       {}", settings.tracking.remove_dir);
    println!("  include errors:   {}", settings.tracking.include_errors);
    println!("  include outputs:  {}", settings.tracking.include_outputs);
    println!("  version:          {}", settings.tracking.version);
    println!("  quit delay:       {}", match settings.tracking.quit_delay_secs {
        d if d < 0 => "disabled".to_string(),
        d => format!("{}s", d),
    });
    println!("  context:          {:?}", ExecutionContext::detect(settings.tracking.context));
    println!("  server:           {}:{}", settings.server.host, settings.server.port);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetched() -> DbConfig {
        DbConfig {
            url: Some("https://remote.example.org".to_string()),
            server_url: Some("https://internal.example.org".to_string()),
            user: Some("remote-user".to_string()),
            password: Some("remote-pass".to_string()),
            base: Some("course".to_string()),
        }
    }

    #[test]
    fn test_overrides_win_over_fetched() {
        let overrides = DbConfig {
            user: Some("local-user".to_string()),
            ..Default::default()
        };

        let merged = overrides.merged_over(fetched());
        assert_eq!(merged.user.as_deref(), Some("local-user"));
        assert_eq!(merged.password.as_deref(), Some("remote-pass"));
        assert_eq!(merged.url.as_deref(), Some("https://remote.example.org"));
    }

    #[test]
    fn test_serialized_keys_are_env_names() {
        let json = serde_json::to_value(fetched()).unwrap();
        assert_eq!(json["MONGO_URL"], "https://remote.example.org");
        assert_eq!(json["MONGO_BASE"], "course");

        let partial: DbConfig = serde_json::from_str(r#"{"MONGO_URL": "sqlite://x.db"}"#).unwrap();
        assert_eq!(partial.url.as_deref(), Some("sqlite://x.db"));
        assert!(partial.user.is_none());
    }

    #[test]
    fn test_endpoint_selection() {
        let config = fetched();
        assert_eq!(config.endpoint(false).unwrap().url, "https://remote.example.org");
        assert_eq!(config.endpoint(true).unwrap().url, "https://internal.example.org");
        assert_eq!(config.endpoint(false).unwrap().database, "course");

        let missing = DbConfig { base: None, ..fetched() };
        assert!(matches!(missing.endpoint(false), Err(TelemetryError::InvalidArgument(_))));
        assert!(DbConfig::default().endpoint(false).is_err());
    }

    #[test]
    fn test_context_override() {
        use ExecutionContext::{Local, Server};
        assert_eq!(ExecutionContext::resolve(Server, None), Server);
        assert_eq!(ExecutionContext::resolve(Server, Some("LOCAL")), Local);
        assert_eq!(ExecutionContext::resolve(Local, Some("server")), Server);
        assert_eq!(ExecutionContext::resolve(Local, Some("cloud")), Local);
    }

    #[test]
    fn test_settings_defaults_from_partial_toml() {
        let settings: Settings = toml::from_str(
            r#"
            [tracking]
            include_outputs = true
            context = "local"
            "#,
        ).unwrap();

        assert_eq!(settings.database.collection, "events");
        assert!(settings.tracking.include_outputs);
        assert!(settings.tracking.include_errors);
        assert_eq!(settings.tracking.quit_delay_secs, 60);
        assert_eq!(settings.tracking.context, ExecutionContext::Local);
        assert_eq!(settings.server.port, 8787);
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.tracking.version = "2.1.0".to_string();
        settings.bootstrap.remote_source = Some("https://example.org/config.enc".to_string());
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.tracking.version, "2.1.0");
        assert_eq!(loaded.bootstrap.remote_source.as_deref(), Some("https://example.org/config.enc"));
    }
}
