pub mod extractor;
pub mod masker;
pub mod miner;
pub mod parser;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod store;

pub use extractor::{ContextExtractor, PROVENANCE_KEY};
pub use masker::{Masker, PiiClass};
pub use miner::{Change, Cluster, MinedTemplate, MinerError, MinerHandle, TemplateMiner, Token};
pub use parser::{parse, ParseError, ParsedRecord, Strategy};
pub use pipeline::{IngestStats, Outcome, Pipeline};
pub use sink::{
    BatchSink, EventSink, JsonlSink, MemorySink, RetryPolicy, SinkError, SinkFailure, SqliteSink,
};
pub use source::{FileSource, RecordReader};
pub use store::{ClusterStore, Snapshot, StoreError};
