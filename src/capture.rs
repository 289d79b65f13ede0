//! Local event capture
//!
//! Buffers one session's inputs, errors and outputs in memory and writes them
//! as a single artifact (`session_<app>_<timestamp>_<session>.json`) when the
//! session finishes. The file appears atomically so a concurrent transfer
//! never reads a half-written artifact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::normalize::{ErrorEvent, InputEvent, OutputEvent, RawSessionLog, SessionInfo};

pub const ARTIFACT_PREFIX: &str = "session_";
pub const ARTIFACT_EXTENSION: &str = "json";

/// Whether a path names a finished session artifact
pub fn is_artifact(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(ARTIFACT_PREFIX))
        .unwrap_or(false);
    let ext_ok = path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION);
    name_ok && ext_ok && path.is_file()
}

/// Artifacts waiting in a directory, oldest name first
pub fn pending_artifacts(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut artifacts: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_artifact(path))
        .collect();
    artifacts.sort();
    artifacts
}

/// In-memory capture for one session
#[derive(Debug)]
pub struct SessionCapture {
    dir: PathBuf,
    app: String,
    session_id: String,
    user_info: String,
    connected: DateTime<Utc>,
    inputs: Vec<InputEvent>,
    errors: Vec<ErrorEvent>,
    outputs: Vec<OutputEvent>,
}

impl SessionCapture {
    pub fn new(dir: PathBuf, app: &str, session_id: &str, user_info: &str) -> Self {
        Self {
            dir,
            app: app.to_string(),
            session_id: session_id.to_string(),
            user_info: user_info.to_string(),
            connected: Utc::now(),
            inputs: Vec::new(),
            errors: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_input(&mut self, event: InputEvent) {
        self.inputs.push(event);
    }

    pub fn record_error(&mut self, event: ErrorEvent) {
        self.errors.push(event);
    }

    pub fn record_output(&mut self, event: OutputEvent) {
        self.outputs.push(event);
    }

    pub fn event_count(&self) -> usize {
        self.inputs.len() + self.errors.len() + self.outputs.len()
    }

    fn artifact_name(&self) -> String {
        let app: String = self.app
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!(
            "{}{}_{}_{}.{}",
            ARTIFACT_PREFIX,
            app,
            self.connected.format("%Y%m%dT%H%M%S"),
            self.session_id,
            ARTIFACT_EXTENSION
        )
    }

    /// Write the artifact into the capture's directory
    pub fn finish(&self, disconnected: DateTime<Utc>) -> Result<PathBuf> {
        self.finish_in(&self.dir, disconnected)
    }

    /// Write the artifact into `dir`; the capture is left intact on failure
    pub fn finish_in(&self, dir: &Path, disconnected: DateTime<Utc>) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

        let name = self.artifact_name();
        let path = dir.join(&name);
        let staging = dir.join(format!(".{}.tmp", name));

        let log = RawSessionLog {
            session: SessionInfo {
                app: self.app.clone(),
                session_id: self.session_id.clone(),
                connected: self.connected,
                disconnected,
                user: self.user_info.clone(),
            },
            inputs: self.inputs.clone(),
            errors: self.errors.clone(),
            outputs: self.outputs.clone(),
        };

        let contents = serde_json::to_string(&log)
            .context("Failed to serialize session log")?;
        std::fs::write(&staging, contents)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &path)
            .with_context(|| format!("Failed to move artifact into place at {}", path.display()))?;

        debug!("Wrote session artifact {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_writes_readable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = SessionCapture::new(dir.path().to_path_buf(), "a01 intro", "s1", r#"{"user":"u"}"#);

        capture.record_input(InputEvent::now("slider", json!(3)));
        capture.record_error(ErrorEvent {
            name: "plot".to_string(),
            timestamp: Utc::now(),
            error: "boom".to_string(),
        });
        assert_eq!(capture.event_count(), 2);

        let path = capture.finish(Utc::now()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("session_a01-intro_"), "unexpected name {}", name);
        assert!(name.ends_with("_s1.json"));

        let log: RawSessionLog = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(log.session.session_id, "s1");
        assert_eq!(log.inputs.len(), 1);
        assert_eq!(log.errors.len(), 1);
        assert!(log.session.disconnected >= log.session.connected);
    }

    #[test]
    fn test_failed_finish_keeps_events_for_another_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "").unwrap();

        let mut capture = SessionCapture::new(blocked, "app", "s2", "{}");
        capture.record_input(InputEvent::now("x", json!(1)));
        assert!(capture.finish(Utc::now()).is_err());

        let elsewhere = dir.path().join("elsewhere");
        let path = capture.finish_in(&elsewhere, Utc::now()).unwrap();
        assert!(path.starts_with(&elsewhere));
        let log: RawSessionLog = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(log.inputs.len(), 1);
    }

    #[test]
    fn test_pending_artifacts_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("session_app_1_a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("session_app_2_b.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".session_app_3_c.json.tmp"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();
        std::fs::write(dir.path().join("session_app.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("session_dir.json")).unwrap();

        let pending = pending_artifacts(dir.path());
        assert_eq!(pending.len(), 2);
        assert!(pending[0].ends_with("session_app_1_a.json"));
    }

    #[test]
    fn test_pending_artifacts_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pending_artifacts(&dir.path().join("absent")).is_empty());
    }
}
