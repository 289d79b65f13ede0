//! Log transfer pipeline
//!
//! Drains session artifacts into the document store. An artifact is deleted
//! only after its insert succeeded; anything else leaves it in place for a
//! later run.

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::capture::pending_artifacts;
use crate::error::{TelemetryError, TelemetryResult};
use crate::normalize::{normalize, NormalizeOptions, RawSessionLog};
use crate::store::{Endpoint, StoreConnector};

/// Destination of a transfer
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub endpoint: Endpoint,
    pub collection: String,
    pub options: NormalizeOptions,
}

pub struct LogTransfer {
    connector: Arc<dyn StoreConnector>,
    target: TransferTarget,
    remove_dir: bool,
}

impl LogTransfer {
    pub fn new(connector: Arc<dyn StoreConnector>, target: TransferTarget) -> Self {
        Self {
            connector,
            target,
            remove_dir: false,
        }
    }

    /// Remove the directory after draining (only succeeds when it ends up empty)
    pub fn with_remove_dir(mut self, remove_dir: bool) -> Self {
        self.remove_dir = remove_dir;
        self
    }

    /// Transfer one artifact; `true` only when it was inserted and deleted
    pub async fn transfer_one(&self, artifact: &Path) -> bool {
        if !artifact.exists() {
            return false;
        }

        match self.try_transfer(artifact).await {
            Ok(count) => {
                debug!("Transferred {} records from {}", count, artifact.display());
                true
            }
            Err(e) => {
                debug!("Transfer of {} failed, keeping it: {}", artifact.display(), e);
                false
            }
        }
    }

    async fn try_transfer(&self, artifact: &Path) -> TelemetryResult<usize> {
        let contents = tokio::fs::read_to_string(artifact).await?;
        let raw: RawSessionLog = serde_json::from_str(&contents)?;

        let documents = normalize(&raw, &self.target.options)
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()?;

        let store = self.connector.connect(&self.target.endpoint).await?;
        let inserted = store.insert_many(&self.target.collection, &documents).await
            .map_err(|e| TelemetryError::transfer(e.to_string()))?;

        if let Err(e) = tokio::fs::remove_file(artifact).await {
            // Inserted but still on disk: the next run would insert it again
            error!("Inserted records from {} but could not delete it: {}", artifact.display(), e);
            return Err(e.into());
        }

        Ok(inserted)
    }

    /// Transfer every pending artifact in `dir`
    ///
    /// Returns `false` without side effects when nothing is pending, otherwise
    /// whether every artifact went through. Individual failures never stop
    /// the rest.
    pub async fn transfer_all(&self, dir: &Path) -> bool {
        let artifacts = pending_artifacts(dir);
        if artifacts.is_empty() {
            return false;
        }

        let mut transferred = 0;
        for artifact in &artifacts {
            if self.transfer_one(artifact).await {
                transferred += 1;
            }
        }

        if transferred < artifacts.len() {
            warn!(
                "Transferred {}/{} artifacts from {}",
                transferred,
                artifacts.len(),
                dir.display()
            );
        } else {
            info!("Transferred {} artifacts from {}", transferred, dir.display());
        }

        if self.remove_dir {
            // Fails unless the directory is now empty
            if tokio::fs::remove_dir(dir).await.is_ok() {
                debug!("Removed drained directory {}", dir.display());
            }
        }

        transferred == artifacts.len()
    }
}
