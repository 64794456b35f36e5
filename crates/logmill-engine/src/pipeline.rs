use std::io;

use logmill_config::IngestConfig;
use logmill_core::{LogEvent, LogmillError};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::extractor::ContextExtractor;
use crate::masker::Masker;
use crate::miner::MinerHandle;
use crate::parser;
use crate::sink::{BatchSink, EventSink, SinkError};

/// Counters for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub ingested: u64,
    pub skipped: u64,
    pub flushed: u64,
    pub batches: u64,
}

impl IngestStats {
    pub fn add(&mut self, other: &IngestStats) {
        self.ingested += other.ingested;
        self.skipped += other.skipped;
        self.flushed += other.flushed;
        self.batches += other.batches;
    }
}

/// What happened to a single raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ingested,
    Skipped,
    Blank,
}

/// Drives one input stream through parse, mask, mine, extract and sink.
///
/// Records are handled strictly in order. The miner handle may be shared
/// with other pipelines; everything else is owned.
pub struct Pipeline<S: EventSink> {
    masker: Masker,
    miner: MinerHandle,
    extractor: ContextExtractor,
    sink: BatchSink<S>,
    ingested: u64,
    skipped: u64,
}

impl<S: EventSink> Pipeline<S> {
    pub fn new(
        masker: Masker,
        miner: MinerHandle,
        source: impl Into<String>,
        sink: BatchSink<S>,
    ) -> Self {
        Self {
            masker,
            miner,
            extractor: ContextExtractor::new(source),
            sink,
            ingested: 0,
            skipped: 0,
        }
    }

    pub fn from_config(
        config: &IngestConfig,
        miner: MinerHandle,
        source: impl Into<String>,
        sink: S,
    ) -> Self {
        Self::new(
            Masker::new(&config.masker),
            miner,
            source,
            BatchSink::from_config(sink, &config.sink),
        )
    }

    pub fn source(&self) -> &str {
        self.extractor.source()
    }

    pub fn init(&mut self) -> Result<(), SinkError> {
        self.sink.init()
    }

    /// Run one raw record through every stage.
    ///
    /// Unparseable records are logged and counted, never returned as errors.
    /// Miner persistence and sink failures are returned to the caller.
    pub fn process_record(&mut self, raw: &str) -> Result<Outcome, LogmillError> {
        if raw.trim().is_empty() {
            return Ok(Outcome::Blank);
        }

        let record = match parser::parse(raw) {
            Ok(record) => record,
            Err(e) => {
                self.skipped += 1;
                warn!("[{}] skipping record: {}", self.source(), e);
                return Ok(Outcome::Skipped);
            }
        };

        let masked = self.masker.mask(&record.body);
        let structured = record.context.as_ref().map(|c| self.masker.mask_context(c));
        let mined = self.miner.mine(&masked)?;
        let context = self.extractor.extract(&masked, structured.as_ref());

        let event = LogEvent::new(
            record.timestamp,
            record.severity,
            record.service_name,
            mined.template,
            context,
            record.trace_id,
        );
        self.ingested += 1;
        self.sink.submit(event)?;
        Ok(Outcome::Ingested)
    }

    /// Process every record, then flush the sink and checkpoint the miner.
    ///
    /// On a structural error the pipeline stops reading and still tries to
    /// flush what it has buffered before returning the error.
    pub fn run<I>(&mut self, records: I) -> Result<IngestStats, LogmillError>
    where
        I: IntoIterator<Item = io::Result<String>>,
    {
        for record in records {
            let result = record
                .map_err(LogmillError::from)
                .and_then(|raw| self.process_record(&raw));
            if let Err(e) = result {
                if !matches!(e, LogmillError::Sink(_)) {
                    if let Err(failure) = self.sink.flush() {
                        error!("[{}] flush after error failed: {}", self.source(), failure);
                    }
                }
                return Err(e);
            }
        }
        self.finish()
    }

    /// Final flush and checkpoint.
    pub fn finish(&mut self) -> Result<IngestStats, LogmillError> {
        self.sink.close()?;
        self.miner.checkpoint()?;
        let stats = self.stats();
        info!(
            "[{}] ingested {}, skipped {}, flushed {} in {} batch(es)",
            self.source(),
            stats.ingested,
            stats.skipped,
            stats.flushed,
            stats.batches
        );
        Ok(stats)
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            ingested: self.ingested,
            skipped: self.skipped,
            flushed: self.sink.flushed(),
            batches: self.sink.batches(),
        }
    }

    pub fn sink(&self) -> &BatchSink<S> {
        &self.sink
    }

    /// Access to the buffer after a sink failure, to retry or drain it.
    pub fn sink_mut(&mut self) -> &mut BatchSink<S> {
        &mut self.sink
    }
}
