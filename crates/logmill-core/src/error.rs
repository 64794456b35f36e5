/// Logmill error types
#[derive(Debug, thiserror::Error)]
pub enum LogmillError {
    #[error("unrecognized log format: {0}")]
    UnrecognizedFormat(String),

    #[error("cluster store failure: {0}")]
    Persistence(String),

    #[error("sink failure: {0}")]
    Sink(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LogmillError {
    /// Per-record errors are skippable; everything else means a durability
    /// guarantee was lost and ingestion should stop.
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::UnrecognizedFormat(_))
    }
}
