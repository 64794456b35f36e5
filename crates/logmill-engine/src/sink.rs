use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::SecondsFormat;
use logmill_config::SinkConfig;
use logmill_core::{LogEvent, LogmillError};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage rejected batch: {0}")]
    Rejected(String),
}

/// A flush that gave up. The events it was trying to write are still in the
/// buffer of the `BatchSink` that returned it.
#[derive(Debug, thiserror::Error)]
#[error("flush failed after {attempts} attempt(s) with {buffered} event(s) still buffered: {last}")]
pub struct SinkFailure {
    pub attempts: u32,
    pub buffered: usize,
    #[source]
    pub last: SinkError,
}

impl From<SinkError> for LogmillError {
    fn from(e: SinkError) -> Self {
        LogmillError::Sink(e.to_string())
    }
}

impl From<SinkFailure> for LogmillError {
    fn from(e: SinkFailure) -> Self {
        LogmillError::Sink(e.to_string())
    }
}

/// Storage collaborator receiving batches of finished events.
pub trait EventSink: Send {
    /// Prepare storage. Must be safe to call more than once.
    fn init(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Persist a batch. Either the whole batch is accepted or an error is
    /// returned and the caller keeps it.
    fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError>;
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn init(&mut self) -> Result<(), SinkError> {
        (**self).init()
    }

    fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
        (**self).insert_batch(events)
    }
}

/// One sink written by several pipelines. Each batch is inserted under the
/// lock, so batches from different pipelines never interleave.
impl<S: EventSink> EventSink for Arc<Mutex<S>> {
    fn init(&mut self) -> Result<(), SinkError> {
        self.lock().unwrap_or_else(PoisonError::into_inner).init()
    }

    fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert_batch(events)
    }
}

// ---------------------------------------------------------------------------
// JSON Lines file
// ---------------------------------------------------------------------------

/// Appends one JSON object per line to a file.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn init(&mut self) -> Result<(), SinkError> {
        if self.writer.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
        self.init()?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::Rejected("sink not initialized".into()));
        };

        let mut buf = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const LOGS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
    timestamp TEXT NOT NULL,
    severity TEXT NOT NULL,
    service_name TEXT NOT NULL,
    trace_id TEXT,
    body TEXT NOT NULL,
    environment TEXT,
    app_id TEXT,
    department TEXT,
    host TEXT,
    region TEXT,
    context TEXT NOT NULL
);
"#;

const INSERT_LOG: &str = "INSERT INTO logs (timestamp, severity, service_name, trace_id, body, \
     environment, app_id, department, host, region, context) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

/// Writes events into a `logs` table, one transaction per batch.
///
/// Timestamps are stored as RFC 3339 text and the context as a JSON object.
pub struct SqliteSink {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for SqliteSink {
    fn init(&mut self) -> Result<(), SinkError> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(LOGS_SCHEMA)?;
        debug!("Opened {}", self.path.display());
        self.conn = Some(conn);
        Ok(())
    }

    fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
        self.init()?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(SinkError::Rejected("sink not initialized".into()));
        };

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_LOG)?;
            for event in events {
                let context = serde_json::to_string(&event.context)?;
                stmt.execute(params![
                    event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                    event.severity,
                    event.service_name,
                    event.trace_id,
                    event.body,
                    event.environment,
                    event.app_id,
                    event.department,
                    event.host,
                    event.region,
                    context,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Collects events in a shared vector. Clones see the same events.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffering and retry
// ---------------------------------------------------------------------------

/// How long one flush keeps retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each one after.
    pub backoff: Duration,
    /// No retry starts after this much time has passed since the flush began.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            timeout: Duration::from_millis(config.flush_timeout_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SinkConfig::default())
    }
}

/// Buffers events and hands them to an `EventSink` in batches.
///
/// The buffer is cleared only after the sink accepts it, so a failed flush
/// leaves every event in place for the caller to retry, drain or drop.
pub struct BatchSink<S: EventSink> {
    sink: S,
    buffer: Vec<LogEvent>,
    batch_size: usize,
    policy: RetryPolicy,
    flushed: u64,
    batches: u64,
}

impl<S: EventSink> BatchSink<S> {
    pub fn new(sink: S, batch_size: usize, policy: RetryPolicy) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            policy,
            flushed: 0,
            batches: 0,
        }
    }

    pub fn from_config(sink: S, config: &SinkConfig) -> Self {
        Self::new(sink, config.batch_size, RetryPolicy::from_config(config))
    }

    pub fn init(&mut self) -> Result<(), SinkError> {
        self.sink.init()
    }

    /// Buffer an event, flushing once the batch is full.
    pub fn submit(&mut self, event: LogEvent) -> Result<(), SinkFailure> {
        self.buffer.push(event);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the whole buffer, retrying with exponential backoff until it
    /// succeeds, the retry budget runs out or the deadline passes.
    pub fn flush(&mut self) -> Result<(), SinkFailure> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.policy.timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.sink.insert_batch(&self.buffer) {
                Ok(()) => {
                    let written = self.buffer.len();
                    self.buffer.clear();
                    self.flushed += written as u64;
                    self.batches += 1;
                    debug!("Flushed batch of {} event(s) after {} attempt(s)", written, attempts);
                    return Ok(());
                }
                Err(e) => {
                    let now = Instant::now();
                    if attempts > self.policy.max_retries || now >= deadline {
                        return Err(SinkFailure {
                            attempts,
                            buffered: self.buffer.len(),
                            last: e,
                        });
                    }
                    let delay = self.policy.delay(attempts).min(deadline - now);
                    warn!(
                        "Batch insert attempt {} failed: {}; retrying in {}ms",
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Final flush on shutdown.
    pub fn close(&mut self) -> Result<(), SinkFailure> {
        self.flush()?;
        info!(
            "Sink closed: {} event(s) in {} batch(es)",
            self.flushed, self.batches
        );
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Remove and return everything still buffered.
    pub fn take_buffered(&mut self) -> Vec<LogEvent> {
        std::mem::take(&mut self.buffer)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use logmill_core::Context;

    fn make_event(body: &str) -> LogEvent {
        LogEvent::new(
            Utc.with_ymd_and_hms(2025, 11, 20, 10, 0, 0).unwrap(),
            "INFO",
            "api",
            body,
            Context::new(),
            None,
        )
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    /// Fails the first `failures` inserts, then records batches.
    struct FlakySink {
        failures: u32,
        calls: u32,
        batches: Vec<usize>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: 0,
                batches: Vec::new(),
            }
        }
    }

    impl EventSink for FlakySink {
        fn insert_batch(&mut self, events: &[LogEvent]) -> Result<(), SinkError> {
            self.calls += 1;
            if self.calls <= self.failures {
                return Err(SinkError::Rejected("connection reset".into()));
            }
            self.batches.push(events.len());
            Ok(())
        }
    }

    #[test]
    fn test_submit_flushes_at_batch_size() {
        let mem = MemorySink::new();
        let mut sink = BatchSink::new(mem.clone(), 2, fast_policy(0));
        sink.submit(make_event("a")).unwrap();
        assert_eq!(mem.len(), 0);
        assert_eq!(sink.pending(), 1);
        sink.submit(make_event("b")).unwrap();
        assert_eq!(mem.len(), 2);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.batches(), 1);
    }

    #[test]
    fn test_close_flushes_partial_batch() {
        let mem = MemorySink::new();
        let mut sink = BatchSink::new(mem.clone(), 10, fast_policy(0));
        sink.submit(make_event("a")).unwrap();
        sink.close().unwrap();
        assert_eq!(mem.len(), 1);
        assert_eq!(sink.flushed(), 1);
    }

    #[test]
    fn test_retry_recovers() {
        let mut sink = BatchSink::new(FlakySink::new(2), 3, fast_policy(3));
        for body in ["a", "b", "c"] {
            sink.submit(make_event(body)).unwrap();
        }
        assert_eq!(sink.sink().calls, 3);
        assert_eq!(sink.sink().batches, vec![3]);
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_failure_keeps_buffer() {
        let mut sink = BatchSink::new(FlakySink::new(10), 2, fast_policy(2));
        sink.submit(make_event("a")).unwrap();
        let err = sink.submit(make_event("b")).unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.buffered, 2);
        assert!(matches!(err.last, SinkError::Rejected(_)));
        assert_eq!(sink.pending(), 2);

        let kept = sink.take_buffered();
        assert_eq!(kept[0].body, "a");
        assert_eq!(kept[1].body, "b");
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_retained_events_flush_later() {
        let mut sink = BatchSink::new(FlakySink::new(1), 5, fast_policy(0));
        sink.submit(make_event("a")).unwrap();
        assert!(sink.flush().is_err());
        assert_eq!(sink.pending(), 1);
        sink.flush().unwrap();
        assert_eq!(sink.sink().batches, vec![1]);
    }

    #[test]
    fn test_deadline_stops_retries() {
        let policy = RetryPolicy {
            max_retries: 100,
            backoff: Duration::from_millis(1),
            timeout: Duration::ZERO,
        };
        let mut sink = BatchSink::new(FlakySink::new(100), 1, policy);
        let err = sink.submit(make_event("a")).unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_shared_sink_collects_from_all_writers() {
        let shared = Arc::new(Mutex::new(MemorySink::new()));
        let mut a = BatchSink::new(Arc::clone(&shared), 1, fast_policy(0));
        let mut b = BatchSink::new(Arc::clone(&shared), 1, fast_policy(0));
        a.submit(make_event("a")).unwrap();
        b.submit(make_event("b")).unwrap();
        assert_eq!(shared.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("events.jsonl");

        let mut sink = JsonlSink::new(&path);
        sink.init().unwrap();
        sink.init().unwrap();
        sink.insert_batch(&[make_event("a"), make_event("b")]).unwrap();
        sink.insert_batch(&[make_event("c")]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let bodies: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<LogEvent>(l).unwrap().body)
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sqlite_sink_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("logs.sqlite");

        let mut context = Context::new();
        context.insert("env".into(), "prod".into());
        context.insert("user_id".into(), "102".into());
        let tagged = LogEvent::new(
            Utc.with_ymd_and_hms(2025, 11, 20, 10, 0, 2).unwrap(),
            "ERROR",
            "payment-service",
            "Card declined for user_id=<*>",
            context,
            Some("abc123".into()),
        );

        let mut sink = SqliteSink::new(&path);
        sink.init().unwrap();
        sink.init().unwrap();
        sink.insert_batch(&[make_event("a"), tagged]).unwrap();
        sink.insert_batch(&[make_event("c")]).unwrap();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);

        let (ts, env, trace, context): (String, Option<String>, Option<String>, String) = conn
            .query_row(
                "SELECT timestamp, environment, trace_id, context FROM logs WHERE severity = 'ERROR'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(ts, "2025-11-20T10:00:02.000000Z");
        assert_eq!(env.as_deref(), Some("prod"));
        assert_eq!(trace.as_deref(), Some("abc123"));
        assert_eq!(context, r#"{"env":"prod","user_id":"102"}"#);
    }

    #[test]
    fn test_sqlite_sink_behind_batch_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.sqlite");
        let mut batch = BatchSink::new(SqliteSink::new(&path), 2, fast_policy(0));
        batch.init().unwrap();
        for body in ["a", "b", "c"] {
            batch.submit(make_event(body)).unwrap();
        }
        batch.close().unwrap();
        assert_eq!(batch.flushed(), 3);

        let conn = Connection::open(&path).unwrap();
        let bodies: Vec<String> = conn
            .prepare("SELECT body FROM logs ORDER BY rowid")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }
}
