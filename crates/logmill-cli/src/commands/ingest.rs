use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use logmill_config::{merge_with_cli, CliOverrides, IngestConfig, SinkKind};
use logmill_core::LogmillError;
use logmill_engine::source::{self, FileSource};
use logmill_engine::{
    EventSink, IngestStats, JsonlSink, MemorySink, MinerHandle, Pipeline, SqliteSink,
    TemplateMiner,
};
use serde::Serialize;
use tracing::error;

type SharedSink = Arc<Mutex<Box<dyn EventSink>>>;

#[derive(Serialize)]
struct FileReport {
    file: String,
    #[serde(flatten)]
    stats: IngestStats,
}

#[derive(Serialize)]
struct IngestReport {
    files: Vec<FileReport>,
    total: IngestStats,
    clusters: usize,
    degraded: bool,
}

pub async fn run(
    config: Option<PathBuf>,
    paths: Vec<PathBuf>,
    overrides: CliOverrides,
    json: bool,
) -> Result<(), LogmillError> {
    let config = merge_with_cli(super::load_config(config.as_deref())?, &overrides)?;
    let files = collect_inputs(&paths)?;
    if files.is_empty() {
        println!("[logmill] No log files found");
        return Ok(());
    }

    let miner = MinerHandle::new(TemplateMiner::from_config(&config.miner)?);
    let sink = open_sink(&config);
    let config = Arc::new(config);

    let mut tasks = Vec::with_capacity(files.len());
    for path in files {
        let config = Arc::clone(&config);
        let miner = miner.clone();
        let sink = Arc::clone(&sink);
        let task_path = path.clone();
        let task = tokio::task::spawn_blocking(move || ingest_file(&config, miner, sink, &task_path));
        tasks.push((path, task));
    }

    let mut reports = Vec::new();
    let mut total = IngestStats::default();
    let mut first_error = None;
    for (path, task) in tasks {
        let result = task.await.map_err(|e| LogmillError::Io(io::Error::other(e)))?;
        match result {
            Ok(stats) => {
                total.add(&stats);
                reports.push(FileReport {
                    file: path.display().to_string(),
                    stats,
                });
            }
            Err(e) => {
                error!("{}: {}", path.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    miner.checkpoint()?;
    let report = IngestReport {
        files: reports,
        total,
        clusters: miner.cluster_count(),
        degraded: miner.is_degraded(),
    };
    print_report(&report, json)?;

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Expand directories to the `*.log` files they contain.
fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, LogmillError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(source::scan_dir(path)?);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn open_sink(config: &IngestConfig) -> SharedSink {
    let sink: Box<dyn EventSink> = match config.sink.kind {
        SinkKind::Jsonl => Box::new(JsonlSink::new(&config.sink.path)),
        SinkKind::Sqlite => Box::new(SqliteSink::new(&config.sink.path)),
        SinkKind::Memory => Box::new(MemorySink::new()),
    };
    Arc::new(Mutex::new(sink))
}

fn ingest_file(
    config: &IngestConfig,
    miner: MinerHandle,
    sink: SharedSink,
    path: &Path,
) -> Result<IngestStats, LogmillError> {
    let source = FileSource::new(path, config.parser.multiline);
    let records = source.open()?;
    let mut pipeline = Pipeline::from_config(config, miner, source.label(), sink);
    pipeline.init()?;
    pipeline.run(records)
}

fn print_report(report: &IngestReport, json: bool) -> Result<(), LogmillError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for file in &report.files {
        println!(
            "[logmill] {}: ingested {}, skipped {}, flushed {} in {} batch(es)",
            file.file,
            file.stats.ingested,
            file.stats.skipped,
            file.stats.flushed,
            file.stats.batches
        );
    }
    println!(
        "[logmill] Total: ingested {}, skipped {}, {} template(s)",
        report.total.ingested, report.total.skipped, report.clusters
    );
    if report.degraded {
        println!("[logmill] Warning: cluster store unavailable, templates were not persisted");
    }
    Ok(())
}
