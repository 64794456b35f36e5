use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use logmill_core::{Context, LogmillError};
use regex::Regex;
use serde_json::{Map, Value};

const TIMESTAMP_KEYS: &[&str] = &["timestamp", "@timestamp", "ts", "time"];
const SEVERITY_KEYS: &[&str] = &["level", "severity", "lvl"];
const SERVICE_KEYS: &[&str] = &["service", "service_name"];
const MESSAGE_KEYS: &[&str] = &["message", "msg", "body"];
const TRACE_KEYS: &[&str] = &["trace_id", "traceId"];

const DEFAULT_SEVERITY: &str = "INFO";
const DEFAULT_SERVICE: &str = "unknown";

/// Longest prefix of a rejected record echoed back in the error.
const PREVIEW_LEN: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognized log format: {0}")]
    UnrecognizedFormat(String),
}

impl From<ParseError> for LogmillError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::UnrecognizedFormat(preview) => LogmillError::UnrecognizedFormat(preview),
        }
    }
}

/// One raw record split into its fixed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub service_name: String,
    pub body: String,
    /// Present only when the record was self-describing.
    pub context: Option<Context>,
    pub trace_id: Option<String>,
}

/// Parsing strategies, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// JSON object with recognizable timestamp and message keys.
    Structured,
    /// `YYYY-MM-DD HH:MM:SS[.fff] SEVERITY SERVICE[:] MESSAGE`
    Canonical,
}

/// Outcome of a single strategy.
#[derive(Debug)]
pub enum Attempt {
    Matched(ParsedRecord),
    Next,
}

impl Strategy {
    pub const ORDER: [Strategy; 2] = [Strategy::Structured, Strategy::Canonical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Canonical => "canonical",
        }
    }

    pub fn attempt(self, raw: &str) -> Attempt {
        let parsed = match self {
            Self::Structured => parse_structured(raw),
            Self::Canonical => parse_canonical(raw),
        };
        match parsed {
            Some(record) => Attempt::Matched(record),
            None => Attempt::Next,
        }
    }
}

/// Parse one raw record, first matching strategy wins.
pub fn parse(raw: &str) -> Result<ParsedRecord, ParseError> {
    let raw = raw.trim();
    for strategy in Strategy::ORDER {
        if let Attempt::Matched(record) = strategy.attempt(raw) {
            return Ok(record);
        }
    }
    Err(ParseError::UnrecognizedFormat(preview(raw)))
}

fn preview(raw: &str) -> String {
    match raw.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Structured (JSON)
// ---------------------------------------------------------------------------

fn parse_structured(raw: &str) -> Option<ParsedRecord> {
    if !raw.starts_with('{') {
        return None;
    }
    let mut obj = match serde_json::from_str::<Value>(raw).ok()? {
        Value::Object(map) => map,
        _ => return None,
    };

    // Timestamp and message are mandatory, the rest falls back to defaults.
    let (ts_key, ts_value) = find_key(&obj, TIMESTAMP_KEYS)?;
    let timestamp = timestamp_from_json(&ts_value)?;
    let (msg_key, msg_value) = find_key(&obj, MESSAGE_KEYS)?;
    let body = value_to_string(&msg_value);
    obj.remove(&ts_key);
    obj.remove(&msg_key);

    let severity = take_string(&mut obj, SEVERITY_KEYS).unwrap_or_else(|| DEFAULT_SEVERITY.into());
    let service_name = take_string(&mut obj, SERVICE_KEYS).unwrap_or_else(|| DEFAULT_SERVICE.into());
    let trace_id = take_string(&mut obj, TRACE_KEYS);

    let context: Context = obj
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();

    Some(ParsedRecord {
        timestamp,
        severity,
        service_name,
        body,
        context: Some(context),
        trace_id,
    })
}

fn find_key(obj: &Map<String, Value>, keys: &[&str]) -> Option<(String, Value)> {
    keys.iter()
        .find_map(|k| obj.get(*k).map(|v| (k.to_string(), v.clone())))
}

fn take_string(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let (key, value) = find_key(obj, keys)?;
    obj.remove(&key);
    match value {
        Value::Null => None,
        other => Some(value_to_string(&other)),
    }
}

/// Context values are always strings.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let n = n.as_i64()?;
            // Anything past year 5138 in seconds is really milliseconds.
            if n.unsigned_abs() >= 100_000_000_000 {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            }
        }
        _ => None,
    }
}

/// RFC 3339 timestamps are converted to UTC; naive ones are taken as UTC as-is.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Canonical (regex)
// ---------------------------------------------------------------------------

static RE_CANONICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)\A(?P<timestamp>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?)\s+(?P<severity>\w+)\s+(?P<service>[\w.\-]+):?\s+(?P<message>.*)\z",
    )
    .unwrap()
});

fn parse_canonical(raw: &str) -> Option<ParsedRecord> {
    let caps = RE_CANONICAL.captures(raw)?;
    let timestamp = parse_timestamp(&caps["timestamp"])?;

    Some(ParsedRecord {
        timestamp,
        severity: caps["severity"].to_string(),
        service_name: caps["service"].to_string(),
        body: caps["message"].to_string(),
        context: None,
        trace_id: None,
    })
}
