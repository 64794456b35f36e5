use std::path::{Path, PathBuf};

use logmill_core::LogmillError;
use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for LogmillError {
    fn from(e: ConfigError) -> Self {
        LogmillError::Config(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// TOML data model
// ---------------------------------------------------------------------------

/// Top-level TOML config file (`logmill.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub masker: MaskerConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Record framing and parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// Fold continuation lines (stack traces) into the preceding record.
    #[serde(default = "default_true")]
    pub multiline: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            multiline: default_true(),
        }
    }
}

/// Which PII classes get redacted. All on by default.
#[derive(Debug, Clone, Deserialize)]
pub struct MaskerConfig {
    #[serde(default = "default_true")]
    pub email: bool,
    #[serde(default = "default_true")]
    pub credit_card: bool,
    #[serde(default = "default_true")]
    pub ssn: bool,
    #[serde(default = "default_true")]
    pub ipv4: bool,
}

impl Default for MaskerConfig {
    fn default() -> Self {
        Self {
            email: true,
            credit_card: true,
            ssn: true,
            ipv4: true,
        }
    }
}

/// What the miner does when the cluster store cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// Log and keep mining in memory only.
    Degrade,
    /// Surface the failure and stop ingestion.
    Halt,
}

/// Template miner tuning and state location.
#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    /// Minimum similarity for a message to join an existing cluster (default: 0.5).
    #[serde(default = "default_similarity")]
    pub similarity_threshold: f64,
    /// Cluster store location. None = in-memory only.
    #[serde(default = "default_state_path")]
    pub state_path: Option<PathBuf>,
    /// Count-only updates between checkpoints (default: 100). New or
    /// generalized clusters are always checkpointed immediately.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    /// Behavior on checkpoint failure (default: degrade).
    #[serde(default = "default_persistence_mode")]
    pub on_persistence_failure: PersistenceMode,
    /// Treat numeric tokens as variable from the first occurrence.
    #[serde(default)]
    pub parametrize_numeric_tokens: bool,
    /// Cluster cap, 0 = unbounded. Past the cap the stalest cluster is evicted.
    #[serde(default)]
    pub max_clusters: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity(),
            state_path: default_state_path(),
            checkpoint_interval: default_checkpoint_interval(),
            on_persistence_failure: default_persistence_mode(),
            parametrize_numeric_tokens: false,
            max_clusters: 0,
        }
    }
}

/// Storage collaborator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Append-only JSON Lines file.
    Jsonl,
    /// `logs` table in a SQLite database file.
    Sqlite,
    /// Keep events in memory (dry runs).
    Memory,
}

/// Batching and retry policy for the event sink.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    /// Output file for the JSON Lines or SQLite sink.
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,
    /// Events per batch (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retries after the first failed insert (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry delay in ms, doubled per attempt (default: 100).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Deadline for one flush including retries, in ms (default: 10000).
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: default_sink_path(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_similarity() -> f64 {
    0.5
}
fn default_state_path() -> Option<PathBuf> {
    Some(PathBuf::from("state/clusters.json"))
}
fn default_checkpoint_interval() -> u32 {
    100
}
fn default_persistence_mode() -> PersistenceMode {
    PersistenceMode::Degrade
}
fn default_sink_kind() -> SinkKind {
    SinkKind::Jsonl
}
fn default_sink_path() -> PathBuf {
    PathBuf::from("data/events.jsonl")
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    100
}
fn default_flush_timeout() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
pub fn load(path: &Path) -> Result<IngestConfig> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

/// Parse TOML string into an IngestConfig.
pub fn parse(toml_str: &str) -> Result<IngestConfig> {
    let config: IngestConfig = toml::from_str(toml_str)?;
    validate(&config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate(config: &IngestConfig) -> Result<()> {
    let miner = &config.miner;

    if !(miner.similarity_threshold > 0.0 && miner.similarity_threshold <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "miner.similarity_threshold must be in (0.0, 1.0], got {}",
            miner.similarity_threshold
        )));
    }

    if miner.checkpoint_interval < 1 {
        return Err(ConfigError::Validation(
            "miner.checkpoint_interval must be >= 1".into(),
        ));
    }

    if let Some(ref path) = miner.state_path {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "miner.state_path must not be empty".into(),
            ));
        }
    }

    let sink = &config.sink;

    if sink.batch_size < 1 {
        return Err(ConfigError::Validation(format!(
            "sink.batch_size must be >= 1, got {}",
            sink.batch_size
        )));
    }

    if sink.kind != SinkKind::Memory && sink.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "sink.path must not be empty for file-backed sinks".into(),
        ));
    }

    if sink.flush_timeout_ms < sink.retry_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "sink.flush_timeout_ms ({}) must be >= sink.retry_backoff_ms ({})",
            sink.flush_timeout_ms, sink.retry_backoff_ms
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI merge
// ---------------------------------------------------------------------------

/// Options from CLI that can override config values.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub state_path: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub similarity_threshold: Option<f64>,
    pub in_memory: bool,
    pub dry_run: bool,
}

/// Apply CLI overrides on top of a loaded config and re-validate.
pub fn merge_with_cli(mut config: IngestConfig, overrides: &CliOverrides) -> Result<IngestConfig> {
    if let Some(ref path) = overrides.state_path {
        config.miner.state_path = Some(path.clone());
    }
    if overrides.in_memory {
        config.miner.state_path = None;
    }
    if let Some(threshold) = overrides.similarity_threshold {
        config.miner.similarity_threshold = threshold;
    }
    if let Some(ref output) = overrides.output {
        config.sink.path = output.clone();
    }
    if let Some(size) = overrides.batch_size {
        config.sink.batch_size = size;
    }
    if overrides.dry_run {
        config.sink.kind = SinkKind::Memory;
    }

    validate(&config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
