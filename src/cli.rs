//! CLI interface for learntrack

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::bootstrap::{BlobSource, Bootstrapped, Bootstrapper};
use crate::config::{self, DbConfig, Settings, ENV_KEY};
use crate::crypto::{self, EncryptedBlob};
use crate::store::{DefaultConnector, StoreConnector};
use crate::tracker::Tracker;
use crate::transfer::{LogTransfer, TransferTarget};

#[derive(Parser)]
#[command(name = "learntrack")]
#[command(about = "Encrypted configuration bootstrap and session telemetry relay for course applications", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a JSON configuration file into a blob
    Encrypt {
        /// Plain JSON mapping of MONGO_* names to values
        input: PathBuf,
        /// Where to write the blob
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, env = ENV_KEY, hide_env_values = true)]
        password: String,
    },
    /// Decrypt a blob and print the configuration
    Decrypt {
        input: PathBuf,
        #[arg(long, env = ENV_KEY, hide_env_values = true)]
        password: String,
        /// Print secret values instead of masking them
        #[arg(long)]
        reveal: bool,
    },
    /// Resolve and validate the database configuration
    Bootstrap {
        #[arg(long, env = ENV_KEY, hide_env_values = true)]
        password: String,
    },
    /// Transfer pending session artifacts from a directory
    Transfer {
        /// Directory holding artifacts (defaults to the configured log dir)
        dir: Option<PathBuf>,
        #[arg(long, env = ENV_KEY, hide_env_values = true)]
        password: String,
        /// Keep the directory even when drained
        #[arg(long)]
        keep_dir: bool,
    },
    /// Start the tracking server
    Serve {
        #[arg(long, env = ENV_KEY, hide_env_values = true)]
        password: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show the current settings
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    match cli.command {
        Commands::Encrypt { input, output, password } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let config: DbConfig = serde_json::from_str(&text)
                .context("Input must be a JSON object of MONGO_* values")?;
            crypto::encrypt(&config, &password)?.write_to(&output)?;
            println!("Encrypted configuration written to {}", output.display());
        }
        Commands::Decrypt { input, password, reveal } => {
            let blob = EncryptedBlob::read_from(&input)?;
            let mut config: DbConfig = crypto::decrypt(&blob, &password)?;
            if !reveal && config.password.is_some() {
                config.password = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Bootstrap { password } => {
            let bootstrapped = bootstrap(&settings, &password).await?;
            println!("Database configuration validated (source: {})", bootstrapped.source);
        }
        Commands::Transfer { dir, password, keep_dir } => {
            let dir = dir
                .or_else(|| settings.tracking.log_dir.clone())
                .context("No directory given and no log_dir configured")?;
            let bootstrapped = bootstrap(&settings, &password).await?;

            let transfer = LogTransfer::new(connector(), TransferTarget {
                endpoint: bootstrapped.config.endpoint(false)?,
                collection: settings.database.collection.clone(),
                options: settings.tracking.normalize_options(),
            })
            .with_remove_dir(!keep_dir);

            if transfer.transfer_all(&dir).await {
                println!("All artifacts in {} transferred", dir.display());
            } else {
                let left = crate::capture::pending_artifacts(&dir).len();
                println!("{} artifact(s) left in {}", left, dir.display());
            }
        }
        Commands::Serve { password, host, port } => {
            let mut settings = settings;
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings, &password).await?;
        }
        Commands::Config => {
            config::show_settings(&settings)?;
        }
    }

    Ok(())
}

fn connector() -> Arc<dyn StoreConnector> {
    Arc::new(DefaultConnector::new())
}

async fn bootstrap(settings: &Settings, password: &str) -> Result<Bootstrapped> {
    let mut bootstrapper = Bootstrapper::new(settings.bootstrap.cache_file()?, password, connector())
        .with_overrides(DbConfig::from_env());
    if let Some(location) = &settings.bootstrap.remote_source {
        bootstrapper = bootstrapper.with_remote(BlobSource::from_location(location));
    }
    Ok(bootstrapper.run().await?)
}

async fn serve(settings: Settings, password: &str) -> Result<()> {
    let db = match bootstrap(&settings, password).await {
        Ok(bootstrapped) => bootstrapped.config,
        Err(e) => {
            // Keep serving: sessions still buffer locally and transfer later
            warn!("{:#}; events will stay in local buffers", e);
            let overrides = DbConfig::from_env();
            if overrides.is_empty() {
                warn!("No database overrides in the environment either");
            }
            overrides
        }
    };

    let tracker = Tracker::new(
        settings.tracking.clone(),
        settings.database.collection.clone(),
        db,
        connector(),
    );

    // Artifacts kept by earlier runs, including per-session temp fallbacks
    tracker.sweep_leftovers(&std::env::temp_dir()).await;

    crate::server::start(&settings.server, tracker).await
}

