//! On-disk cluster store.
//!
//! The store is a single JSON document rewritten atomically (temp file +
//! rename), so a crash mid-checkpoint leaves the previous snapshot intact.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use logmill_core::LogmillError;
use serde::{Deserialize, Serialize};

use crate::miner::Cluster;

pub const STORE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read cluster store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write cluster store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt cluster store: {0}")]
    Corrupt(String),

    #[error("failed to serialize cluster store: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<StoreError> for LogmillError {
    fn from(e: StoreError) -> Self {
        LogmillError::Persistence(e.to_string())
    }
}

/// Everything needed to rebuild the miner index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub next_id: u64,
    pub clusters: Vec<Cluster>,
}

impl Snapshot {
    /// Reject snapshots that could not have been written by the miner.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.version != STORE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.next_id == u64::MAX {
            return Err(StoreError::Corrupt("next_id exhausted".into()));
        }
        let mut seen = HashSet::with_capacity(self.clusters.len());
        for c in &self.clusters {
            if !seen.insert(c.id) {
                return Err(StoreError::Corrupt(format!("duplicate cluster id {}", c.id)));
            }
            if c.token_count != c.token_pattern.len() {
                return Err(StoreError::Corrupt(format!(
                    "cluster {}: token_count {} != pattern length {}",
                    c.id,
                    c.token_count,
                    c.token_pattern.len()
                )));
            }
            if c.id >= self.next_id {
                return Err(StoreError::Corrupt(format!(
                    "cluster {} not below next_id {}",
                    c.id, self.next_id
                )));
            }
        }
        Ok(())
    }
}

/// File-backed cluster snapshot.
#[derive(Debug, Clone)]
pub struct ClusterStore {
    path: PathBuf,
}

impl ClusterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let snapshot: Snapshot =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    /// Atomically replace the snapshot on disk.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).map_err(write_err)?;
        file.write_all(&data).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::Token;
    use chrono::{TimeZone, Utc};

    fn make_cluster(id: u64, tokens: &[&str]) -> Cluster {
        Cluster {
            id,
            token_pattern: tokens.iter().map(|t| Token::Literal(t.to_string())).collect(),
            token_count: tokens.len(),
            match_count: 1,
            last_seen: Utc.with_ymd_and_hms(2025, 11, 20, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::new(dir.path().join("clusters.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::new(dir.path().join("nested/state/clusters.json"));
        let mut cluster = make_cluster(0, &["Server", "started"]);
        cluster.token_pattern[1] = Token::Wildcard;
        let snapshot = Snapshot {
            version: STORE_VERSION,
            next_id: 3,
            clusters: vec![cluster, make_cluster(2, &["user=bob", "logged", "in"])],
        };

        store.save(&snapshot).unwrap();
        assert!(!store.tmp_path().exists());
        assert_eq!(store.load().unwrap(), Some(snapshot));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.json");
        fs::write(&path, "{ not json").unwrap();
        let err = ClusterStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_inconsistent_snapshot_is_corrupt() {
        let mut bad = make_cluster(0, &["a", "b"]);
        bad.token_count = 5;
        let snapshot = Snapshot {
            version: STORE_VERSION,
            next_id: 1,
            clusters: vec![bad],
        };
        assert!(matches!(snapshot.validate(), Err(StoreError::Corrupt(_))));

        let reused = Snapshot {
            version: STORE_VERSION,
            next_id: 0,
            clusters: vec![make_cluster(0, &["a"])],
        };
        assert!(matches!(reused.validate(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_duplicate_ids_are_corrupt() {
        let snapshot = Snapshot {
            version: STORE_VERSION,
            next_id: 2,
            clusters: vec![make_cluster(1, &["a"]), make_cluster(1, &["b", "c"])],
        };
        let err = snapshot.validate().unwrap_err();
        assert_eq!(err.to_string(), "corrupt cluster store: duplicate cluster id 1");
    }

    #[test]
    fn test_exhausted_next_id_is_corrupt() {
        let snapshot = Snapshot {
            version: STORE_VERSION,
            next_id: u64::MAX,
            clusters: vec![make_cluster(0, &["a"])],
        };
        assert!(matches!(snapshot.validate(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_duplicate_ids_on_disk_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.json");
        let snapshot = Snapshot {
            version: STORE_VERSION,
            next_id: 8,
            clusters: vec![make_cluster(7, &["a", "b"]), make_cluster(7, &["c"])],
        };
        fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();
        let err = ClusterStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
