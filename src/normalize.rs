//! Event log normalizer
//!
//! Converts one raw session capture into the canonical, time-ordered event
//! records that are written to the document store. Malformed embedded JSON
//! never aborts a conversion; the affected field falls back to a default.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Input id of the quit button
pub const QUIT_LABEL: &str = "quit";

/// Hidden input carrying submitted results
pub const RESULT_LABEL: &str = "__learntrack_result__";

/// Prefix of the tutorial identifier
pub const TUTORIAL_PREFIX: &str = "shiny_";

/// Per-session capture as written by [`crate::capture::SessionCapture`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSessionLog {
    pub session: SessionInfo,
    #[serde(default)]
    pub inputs: Vec<InputEvent>,
    #[serde(default)]
    pub errors: Vec<ErrorEvent>,
    #[serde(default)]
    pub outputs: Vec<OutputEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub app: String,
    pub session_id: String,
    pub connected: DateTime<Utc>,
    pub disconnected: DateTime<Utc>,
    /// Opaque user-info JSON as received from the client
    #[serde(default)]
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub value: Value,
    #[serde(default, rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub binding: String,
}

impl InputEvent {
    pub fn now(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            value,
            input_type: String::new(),
            binding: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub binding: String,
}

/// Graded-correct, graded-incorrect, or ungraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Correctness {
    #[serde(rename = "TRUE")]
    True,
    #[serde(rename = "FALSE")]
    False,
    #[serde(rename = "NA")]
    Na,
}

impl From<bool> for Correctness {
    fn from(value: bool) -> Self {
        if value { Correctness::True } else { Correctness::False }
    }
}

impl std::fmt::Display for Correctness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Correctness::True => write!(f, "TRUE"),
            Correctness::False => write!(f, "FALSE"),
            Correctness::Na => write!(f, "NA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "session.id")]
    SessionId,
    #[serde(rename = "inputs")]
    Inputs,
    #[serde(rename = "errors")]
    Errors,
    #[serde(rename = "outputs")]
    Outputs,
    #[serde(rename = "result")]
    Result,
    #[serde(rename = "quit")]
    Quit,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::SessionId => write!(f, "session.id"),
            EventKind::Inputs => write!(f, "inputs"),
            EventKind::Errors => write!(f, "errors"),
            EventKind::Outputs => write!(f, "outputs"),
            EventKind::Result => write!(f, "result"),
            EventKind::Quit => write!(f, "quit"),
        }
    }
}

/// One canonical telemetry row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub session: String,
    pub date: DateTime<Utc>,
    pub tutorial: String,
    pub version: String,
    pub user: String,
    pub login: String,
    pub email: String,
    pub label: String,
    pub correct: Correctness,
    pub event: EventKind,
    /// JSON object text with `type` and `binding`
    pub metadata: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub version: String,
    pub include_errors: bool,
    pub include_outputs: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            include_errors: true,
            include_outputs: false,
        }
    }
}

/// Identity embedded in the session's user-info string
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct UserInfo {
    #[serde(default)]
    user: String,
    #[serde(default)]
    login: String,
    #[serde(default)]
    iemail: String,
}

/// Parse JSON, falling back to `default` on any error
pub fn parse_or_default<T: DeserializeOwned>(text: &str, default: impl FnOnce() -> T) -> T {
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Falling back to default for malformed JSON ({}): {:.80}", e, text);
            default()
        }
    }
}

/// Flatten a captured value into the string stored on the record
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) if items.len() == 1 && !items[0].is_array() && !items[0].is_object() => {
            coerce_to_string(&items[0])
        }
        other => other.to_string(),
    }
}

fn metadata(input_type: &str, binding: &str) -> String {
    serde_json::json!({ "type": input_type, "binding": binding }).to_string()
}

/// Normalize one raw session log into ordered event records
pub fn normalize(raw: &RawSessionLog, options: &NormalizeOptions) -> Vec<EventRecord> {
    let info: UserInfo = parse_or_default(&raw.session.user, UserInfo::default);
    let tutorial = format!("{}{}", TUTORIAL_PREFIX, raw.session.app);
    let email = info.iemail.to_lowercase();

    let record = |date: DateTime<Utc>, label: &str, event: EventKind, metadata: String, value: String| {
        EventRecord {
            session: raw.session.session_id.clone(),
            date,
            tutorial: tutorial.clone(),
            version: options.version.clone(),
            user: info.user.clone(),
            login: info.login.clone(),
            email: email.clone(),
            label: label.to_string(),
            correct: Correctness::Na,
            event,
            metadata,
            value,
        }
    };

    let mut records = vec![
        record(raw.session.connected, "start", EventKind::SessionId, metadata("", ""), raw.session.user.clone()),
        record(raw.session.disconnected, "stop", EventKind::SessionId, metadata("", ""), String::new()),
    ];

    records.extend(raw.inputs.iter().map(|input| {
        record(
            input.timestamp,
            &input.name,
            EventKind::Inputs,
            metadata(&input.input_type, &input.binding),
            coerce_to_string(&input.value),
        )
    }));

    if options.include_errors {
        records.extend(raw.errors.iter().map(|error| {
            record(error.timestamp, &error.name, EventKind::Errors, metadata("", ""), error.error.clone())
        }));
    }

    if options.include_outputs {
        records.extend(raw.outputs.iter().map(|output| {
            record(
                output.timestamp,
                &output.name,
                EventKind::Outputs,
                metadata("", &output.binding),
                coerce_to_string(&output.value),
            )
        }));
    }

    for rec in records.iter_mut() {
        if rec.label == QUIT_LABEL {
            rec.event = EventKind::Quit;
            rec.label.clear();
        } else if rec.label == RESULT_LABEL {
            rec.event = EventKind::Result;
            rec.label.clear();
            let (correct, value) = split_result(&rec.value);
            rec.correct = correct;
            rec.value = value;
        }
    }

    let mut records = keep_one_result(records);

    if !records.iter().any(|r| r.event == EventKind::Result) {
        records.push(record(
            raw.session.disconnected,
            "",
            EventKind::Result,
            metadata("", ""),
            String::new(),
        ));
    }

    // Stable, so records sharing a timestamp keep emission order
    records.sort_by_key(|r| r.date);
    records
}

/// Whether an input name is reserved for the quit and result flows
pub fn is_reserved_label(name: &str) -> bool {
    name == QUIT_LABEL || name == RESULT_LABEL
}

/// Collapse repeated submissions into a single `result` record
///
/// The latest graded submission wins. When none is graded, the earliest
/// submission is kept.
fn keep_one_result(records: Vec<EventRecord>) -> Vec<EventRecord> {
    let results: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.event == EventKind::Result)
        .map(|(i, _)| i)
        .collect();

    if results.len() < 2 {
        return records;
    }

    let keep = results
        .iter()
        .copied()
        .filter(|&i| records[i].correct != Correctness::Na)
        .max_by_key(|&i| (records[i].date, i))
        .or_else(|| results.iter().copied().min_by_key(|&i| (records[i].date, i)));

    debug!("Collapsing {} submissions into one result record", results.len());

    records
        .into_iter()
        .enumerate()
        .filter(|(i, r)| r.event != EventKind::Result || Some(*i) == keep)
        .map(|(_, r)| r)
        .collect()
}

/// Pull `correct` out of a result payload, returning the rest re-serialized
fn split_result(payload: &str) -> (Correctness, String) {
    let Some(mut object) = parse_or_default::<Option<Map<String, Value>>>(payload, || None) else {
        return (Correctness::Na, payload.to_string());
    };

    let correct = match object.shift_remove("correct") {
        Some(Value::Bool(b)) => Correctness::from(b),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Correctness::True,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Correctness::False,
        _ => Correctness::Na,
    };

    (correct, Value::Object(object).to_string())
}
