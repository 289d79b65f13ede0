//! Session tracking controller
//!
//! Owns the registry of active sessions. Each session gets an identity from
//! its query parameters, a writable buffer directory and a capture; at session
//! end the capture is flushed and the buffer drained into the store. A quit
//! schedules a check that shuts the process down once no session is left.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::{pending_artifacts, SessionCapture};
use crate::config::{DbConfig, ExecutionContext, TrackingSettings};
use crate::error::{TelemetryError, TelemetryResult};
use crate::normalize::{ErrorEvent, InputEvent, OutputEvent, QUIT_LABEL, RESULT_LABEL};
use crate::store::{Endpoint, StoreConnector};
use crate::transfer::{LogTransfer, TransferTarget};

/// Name prefix of per-session fallback buffer directories
pub const FALLBACK_DIR_PREFIX: &str = "learntrack-";

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Message,
    Success,
    Warning,
    Error,
}

/// Human-readable message to show in the course application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into() }
    }
}

/// Who is using the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub login: String,
    pub email: String,
}

impl Identity {
    /// Read identity from query parameters; `user` is required
    pub fn from_query(query: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| query.get(key).map(|v| v.trim().to_string()).unwrap_or_default();

        let user = get("user");
        if user.is_empty() {
            return None;
        }

        let email = match get("email") {
            e if e.is_empty() => get("iemail"),
            e => e,
        };

        Some(Self { user, login: get("login"), email })
    }

    /// The user-info string stored with the session
    pub fn user_info(&self) -> String {
        json!({ "user": self.user, "login": self.login, "iemail": self.email }).to_string()
    }
}

/// Outcome of starting a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub session_id: String,
    pub tracking: bool,
    pub buffer_dir: Option<PathBuf>,
    pub notice: Option<Notice>,
}

/// Outcome of a submission
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub correct: bool,
    pub notice: Notice,
}

/// Outcome of a quit
#[derive(Debug)]
pub struct QuitOutcome {
    pub notice: Notice,
    /// Delayed idle check; resolves to whether it requested shutdown
    pub shutdown_check: Option<JoinHandle<bool>>,
}

struct ActiveSession {
    capture: Option<SessionCapture>,
}

pub struct Tracker {
    settings: TrackingSettings,
    context: ExecutionContext,
    collection: String,
    db: DbConfig,
    connector: Arc<dyn StoreConnector>,
    sessions: RwLock<HashMap<String, ActiveSession>>,
    /// Serializes transfers so two sessions sharing a buffer never insert the same artifact
    transfer_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Tracker {
    pub fn new(
        settings: TrackingSettings,
        collection: impl Into<String>,
        db: DbConfig,
        connector: Arc<dyn StoreConnector>,
    ) -> Arc<Self> {
        let context = ExecutionContext::detect(settings.context);
        Self::with_context(settings, collection, db, connector, context)
    }

    /// Like [`Tracker::new`], with the execution context given instead of detected
    pub fn with_context(
        settings: TrackingSettings,
        collection: impl Into<String>,
        db: DbConfig,
        connector: Arc<dyn StoreConnector>,
        context: ExecutionContext,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            context,
            collection: collection.into(),
            db,
            connector,
            sessions: RwLock::new(HashMap::new()),
            transfer_lock: Mutex::new(()),
            shutdown,
        })
    }

    /// Receiver flipped to `true` when the process should exit
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Register a new session and set up its capture
    pub async fn start_session(&self, app: &str, query: &HashMap<String, String>) -> SessionStart {
        let session_id = uuid::Uuid::new_v4().simple().to_string();

        let (capture, notice) = match Identity::from_query(query) {
            None => {
                info!("Session {} has no identity, tracking disabled", session_id);
                (None, Some(Notice::new(
                    NoticeLevel::Warning,
                    "You are not identified: your activity in this application is not recorded.",
                )))
            }
            Some(identity) => match choose_buffer_dir(self.settings.log_dir.as_deref(), &session_id) {
                Ok(dir) => {
                    debug!("Session {} buffers to {}", session_id, dir.display());
                    (Some(SessionCapture::new(dir, app, &session_id, &identity.user_info())), None)
                }
                Err(e) => {
                    warn!("No writable buffer for session {}: {}", session_id, e);
                    (None, Some(Notice::new(
                        NoticeLevel::Error,
                        "Activity recording is unavailable for this session.",
                    )))
                }
            },
        };

        let buffer_dir = capture.as_ref().map(|c| c.dir().to_path_buf());
        let tracking = capture.is_some();

        self.sessions.write().await.insert(session_id.clone(), ActiveSession { capture });
        info!("Session {} started for {} ({} active)", session_id, app, self.active_sessions().await);

        SessionStart { session_id, tracking, buffer_dir, notice }
    }

    async fn with_capture<F>(&self, session_id: &str, f: F) -> TelemetryResult<bool>
    where
        F: FnOnce(&mut SessionCapture),
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)
            .ok_or_else(|| unknown_session(session_id))?;

        match session.capture.as_mut() {
            Some(capture) => {
                f(capture);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record an input change; `Ok(false)` when the session is untracked
    pub async fn record_input(&self, session_id: &str, event: InputEvent) -> TelemetryResult<bool> {
        self.with_capture(session_id, |c| c.record_input(event)).await
    }

    pub async fn record_error(&self, session_id: &str, event: ErrorEvent) -> TelemetryResult<bool> {
        self.with_capture(session_id, |c| c.record_error(event)).await
    }

    pub async fn record_output(&self, session_id: &str, event: OutputEvent) -> TelemetryResult<bool> {
        self.with_capture(session_id, |c| c.record_output(event)).await
    }

    /// End a session: flush its capture and drain its buffer
    ///
    /// Returns `None` if the session was unknown or already ended, so
    /// concurrent calls for one session transfer at most once. Untracked
    /// sessions end with `Some(false)`.
    pub async fn end_session(&self, session_id: &str) -> Option<bool> {
        let session = self.sessions.write().await.remove(session_id)?;
        info!("Session {} ended ({} active)", session_id, self.active_sessions().await);

        let Some(capture) = session.capture else {
            return Some(false);
        };
        debug!("Session {} captured {} events", session_id, capture.event_count());

        let disconnected = chrono::Utc::now();
        let dir = match capture.finish(disconnected) {
            Ok(_) => capture.dir().to_path_buf(),
            Err(e) => {
                warn!("Could not write artifact for session {}: {:#}", session_id, e);
                match write_to_fallback(&capture, session_id, disconnected) {
                    Some(dir) => dir,
                    None => return Some(false),
                }
            }
        };

        let endpoint = match self.resolve_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("No database endpoint, keeping artifacts in {}: {}", dir.display(), e);
                return Some(false);
            }
        };

        let transfer = self.transfer_to(endpoint).with_remove_dir(self.settings.remove_dir);

        let _guard = self.transfer_lock.lock().await;
        Some(transfer.transfer_all(&dir).await)
    }

    fn transfer_to(&self, endpoint: Endpoint) -> LogTransfer {
        LogTransfer::new(
            self.connector.clone(),
            TransferTarget {
                endpoint,
                collection: self.collection.clone(),
                options: self.settings.normalize_options(),
            },
        )
    }

    /// Drain artifacts left behind by earlier runs
    ///
    /// Covers the configured log directory and every per-session fallback
    /// directory under `temp_root`. Drained fallback directories are removed.
    /// Returns the number of artifacts still pending.
    pub async fn sweep_leftovers(&self, temp_root: &Path) -> usize {
        let mut dirs: Vec<(PathBuf, bool)> = Vec::new();
        if let Some(dir) = &self.settings.log_dir {
            dirs.push((dir.clone(), self.settings.remove_dir));
        }
        dirs.extend(fallback_buffer_dirs(temp_root).into_iter().map(|dir| (dir, true)));

        let pending = |dirs: &[(PathBuf, bool)]| -> usize {
            dirs.iter().map(|(dir, _)| pending_artifacts(dir).len()).sum()
        };

        let endpoint = match self.resolve_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Skipping startup sweep: {}", e);
                return pending(&dirs);
            }
        };

        let _guard = self.transfer_lock.lock().await;
        for (dir, remove_dir) in &dirs {
            let transfer = self.transfer_to(endpoint.clone()).with_remove_dir(*remove_dir);
            if !transfer.transfer_all(dir).await && *remove_dir {
                // Nothing pending; an empty leftover goes too
                let _ = tokio::fs::remove_dir(dir).await;
            }
        }

        let left = pending(&dirs);
        if left > 0 {
            warn!("{} artifacts could not be transferred during the startup sweep", left);
        }
        left
    }

    /// Prefer the server URL when deployed and reachable, else the default URL
    pub async fn resolve_endpoint(&self) -> TelemetryResult<Endpoint> {
        if self.context != ExecutionContext::Local && self.db.server_url.is_some() {
            let server = self.db.endpoint(true)?;
            match self.ping(&server).await {
                Ok(()) => return Ok(server),
                Err(e) => debug!("Server URL unreachable, using default URL: {}", e),
            }
        }

        self.db.endpoint(false)
    }

    async fn ping(&self, endpoint: &Endpoint) -> TelemetryResult<()> {
        self.connector.connect(endpoint).await?.ping().await
    }

    /// Grade a submission and record the result payload
    pub async fn track_submit(
        &self,
        session_id: &str,
        answer: &Map<String, Value>,
        solution: &Map<String, Value>,
        comment: Option<&str>,
    ) -> TelemetryResult<Submission> {
        if solution.is_empty() {
            return Err(TelemetryError::invalid("solution must name at least one input"));
        }

        let correct = answer_matches(answer, solution);
        let payload = json!({
            "correct": correct,
            "answer": answer,
            "solution": solution,
            "comment": comment.unwrap_or(""),
        });

        let mut event = InputEvent::now(RESULT_LABEL, Value::String(payload.to_string()));
        event.input_type = "hidden".to_string();
        self.record_input(session_id, event).await?;

        let notice = if correct {
            Notice::new(NoticeLevel::Success, "Correct answer!")
        } else {
            Notice::new(NoticeLevel::Error, "Incorrect answer, try again.")
        };

        Ok(Submission { correct, notice })
    }

    /// Close the session now and schedule the idle-process check
    ///
    /// `delay_secs` falls back to the configured delay; a negative delay
    /// disables the check. Unknown or already-ended sessions are an error and
    /// schedule nothing.
    pub async fn track_quit(
        self: &Arc<Self>,
        session_id: &str,
        delay_secs: Option<i64>,
    ) -> TelemetryResult<QuitOutcome> {
        // The quit press is itself an input event
        self.record_input(session_id, InputEvent::now(QUIT_LABEL, json!(1))).await?;
        if self.end_session(session_id).await.is_none() {
            return Err(unknown_session(session_id));
        }

        let delay = delay_secs.unwrap_or(self.settings.quit_delay_secs);
        let shutdown_check = (delay >= 0).then(|| {
            let tracker = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay as u64)).await;
                tracker.shutdown_if_idle().await
            })
        });

        Ok(QuitOutcome {
            notice: Notice::new(NoticeLevel::Message, "Session closed. You can close this window."),
            shutdown_check,
        })
    }

    async fn shutdown_if_idle(&self) -> bool {
        let active = self.active_sessions().await;
        if active < 1 {
            info!("No active sessions left, shutting down");
            self.shutdown.send_replace(true);
            true
        } else {
            debug!("{} sessions still active, staying up", active);
            false
        }
    }
}

fn unknown_session(session_id: &str) -> TelemetryError {
    TelemetryError::invalid(format!("unknown session '{}'", session_id))
}

/// Write an artifact the capture's own directory refused into the temp fallback
fn write_to_fallback(
    capture: &SessionCapture,
    session_id: &str,
    disconnected: chrono::DateTime<chrono::Utc>,
) -> Option<PathBuf> {
    let written = choose_buffer_dir(None, session_id)
        .map_err(anyhow::Error::from)
        .and_then(|dir| capture.finish_in(&dir, disconnected).map(|_| dir));

    match written {
        Ok(dir) => {
            warn!("Session {} artifact written to fallback {}", session_id, dir.display());
            Some(dir)
        }
        Err(e) => {
            error!("Dropping {} events of session {}: {:#}", capture.event_count(), session_id, e);
            None
        }
    }
}

/// Per-session fallback directories under `root`, in name order
pub fn fallback_buffer_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(FALLBACK_DIR_PREFIX))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Pick the configured directory if usable, else a session-unique temp directory
pub fn choose_buffer_dir(configured: Option<&Path>, session_id: &str) -> TelemetryResult<PathBuf> {
    if let Some(dir) = configured {
        if is_writable_dir(dir) {
            return Ok(dir.to_path_buf());
        }
        warn!("Log directory {} is not writable, using a temporary one", dir.display());
    }

    let fallback = std::env::temp_dir().join(format!("{}{}", FALLBACK_DIR_PREFIX, session_id));
    std::fs::create_dir_all(&fallback)?;
    if is_writable_dir(&fallback) {
        Ok(fallback)
    } else {
        Err(TelemetryError::invalid(format!("{} is not writable", fallback.display())))
    }
}

/// Create the directory if needed and prove it accepts writes
fn is_writable_dir(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let scratch = dir.join(format!(".write-check-{}", uuid::Uuid::new_v4().simple()));
    let writable = std::fs::write(&scratch, b"ok").is_ok();
    let _ = std::fs::remove_file(&scratch);
    writable
}

/// Field-by-field comparison in solution order; answer fields the solution does not name are ignored
pub fn answer_matches(answer: &Map<String, Value>, solution: &Map<String, Value>) -> bool {
    solution.iter().all(|(key, expected)| {
        answer.get(key).map(|given| values_match(given, expected)).unwrap_or(false)
    })
}

fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_match(x, y))
        }
        // A single value and a one-element vector are the same answer
        (Value::Array(xs), other) | (other, Value::Array(xs)) if xs.len() == 1 => values_match(&xs[0], other),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map(|w| values_match(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}
