use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Dynamic fields of a record, keyed by field name. Insertion-ordered so the
/// first writer of a key is also the first one listed.
pub type Context = IndexMap<String, String>;

/// A fully normalized log record as handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub service_name: String,
    /// The mined template, never the raw message.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl LogEvent {
    /// Build an event and promote the fixed metadata fields out of `context`.
    /// Promoted keys stay in `context` as well.
    pub fn new(
        timestamp: DateTime<Utc>,
        severity: impl Into<String>,
        service_name: impl Into<String>,
        body: impl Into<String>,
        context: Context,
        trace_id: Option<String>,
    ) -> Self {
        let lookup = |keys: &[&str]| keys.iter().find_map(|k| context.get(*k).cloned());

        Self {
            timestamp,
            severity: severity.into(),
            service_name: service_name.into(),
            body: body.into(),
            environment: lookup(&["environment", "env"]),
            app_id: lookup(&["app_id"]),
            department: lookup(&["department", "dept"]),
            host: lookup(&["host"]),
            region: lookup(&["region"]),
            trace_id,
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_context(pairs: &[(&str, &str)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_promotes_metadata_aliases() {
        let ctx = make_context(&[
            ("env", "prod"),
            ("dept", "finance"),
            ("host", "server-007"),
            ("region", "us-east-1"),
            ("app_id", "com.example.payment"),
        ]);
        let ts = Utc.with_ymd_and_hms(2025, 11, 20, 10, 0, 1).unwrap();
        let event = LogEvent::new(ts, "INFO", "payment-service", "Payment <*>", ctx, None);

        assert_eq!(event.environment.as_deref(), Some("prod"));
        assert_eq!(event.department.as_deref(), Some("finance"));
        assert_eq!(event.host.as_deref(), Some("server-007"));
        assert_eq!(event.region.as_deref(), Some("us-east-1"));
        assert_eq!(event.app_id.as_deref(), Some("com.example.payment"));
        // Promoted keys are kept in context.
        assert_eq!(event.context.get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_long_alias_wins_over_short() {
        let ctx = make_context(&[("env", "staging"), ("environment", "prod")]);
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let event = LogEvent::new(ts, "WARN", "svc", "body", ctx, None);
        assert_eq!(event.environment.as_deref(), Some("prod"));
    }

    #[test]
    fn test_serialize_omits_missing_metadata() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let event = LogEvent::new(ts, "INFO", "svc", "hello", Context::new(), None);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("host").is_none());
        assert!(json.get("trace_id").is_none());
        assert_eq!(json["timestamp"], "2025-01-01T00:00:00Z");

        let back: LogEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
