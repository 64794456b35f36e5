use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Lines folded into the preceding record: indented lines, stack frames,
/// exception chains and elisions.
static RE_CONTINUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\s|at |Caused by|Traceback|\.\.\.)").unwrap());

pub fn is_continuation(line: &str) -> bool {
    RE_CONTINUATION.is_match(line)
}

/// Lazily yields raw records from a byte reader.
///
/// Lines are decoded lossily, so invalid UTF-8 reaches the parser as a
/// record with replacement characters instead of failing the stream. With
/// `multiline` on, continuation lines are appended to the preceding record
/// and blank lines are dropped. A continuation with no preceding record is
/// yielded on its own.
pub struct RecordReader<R> {
    reader: R,
    multiline: bool,
    buf: Vec<u8>,
    pending: Option<String>,
    /// Read error held back until the pending record has been yielded.
    deferred: Option<io::Error>,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, multiline: bool) -> Self {
        Self {
            reader,
            multiline,
            buf: Vec::new(),
            pending: None,
            deferred: None,
        }
    }

    fn read_line(&mut self) -> Option<io::Result<String>> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&self.buf).into_owned()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.deferred.take() {
            return Some(Err(e));
        }

        loop {
            let line = match self.read_line() {
                Some(Ok(line)) => line,
                Some(Err(e)) => match self.pending.take() {
                    Some(done) => {
                        self.deferred = Some(e);
                        return Some(Ok(done));
                    }
                    None => return Some(Err(e)),
                },
                None => return self.pending.take().map(Ok),
            };

            if !self.multiline {
                return Some(Ok(line));
            }
            if line.trim().is_empty() {
                continue;
            }

            match self.pending.as_mut() {
                Some(record) if is_continuation(&line) => {
                    record.push('\n');
                    record.push_str(&line);
                }
                _ => {
                    if let Some(done) = self.pending.replace(line) {
                        return Some(Ok(done));
                    }
                }
            }
        }
    }
}

/// A log file that can be read from the start any number of times.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    multiline: bool,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, multiline: bool) -> Self {
        Self {
            path: path.into(),
            multiline,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name used as the provenance value.
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn open(&self) -> io::Result<RecordReader<BufReader<File>>> {
        let file = File::open(&self.path)?;
        Ok(RecordReader::new(BufReader::new(file), self.multiline))
    }
}

/// All `*.log` files directly inside `dir`, sorted by name.
pub fn scan_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    files.sort();
    Ok(files)
}
