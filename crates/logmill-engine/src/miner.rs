//! Online template mining.
//!
//! Messages are tokenized on whitespace and bucketed by token count. Within a
//! bucket each cluster is scored by the fraction of positions whose literal
//! equals the incoming token (wildcard positions always match). A message at
//! or above the similarity threshold joins the best cluster and generalizes
//! every differing literal to a wildcard; otherwise it seeds a new cluster.
//! Generalization is one-way: Literal -> Param -> Wildcard.
//!
//! Templates are rebuilt from tokens joined by single spaces, so runs of
//! whitespace and the newlines of a folded multiline record collapse in the
//! rendered template.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logmill_config::{MinerConfig, PersistenceMode};
use logmill_core::LogmillError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extractor::split_pair;
use crate::store::{ClusterStore, Snapshot, StoreError, STORE_VERSION};

/// Rendered form of a wildcard position.
pub const WILDCARD: &str = "<*>";

/// Attempts per checkpoint write before it is reported as failed.
const CHECKPOINT_ATTEMPTS: u32 = 3;
const CHECKPOINT_BACKOFF_MS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum MinerError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl From<MinerError> for LogmillError {
    fn from(e: MinerError) -> Self {
        LogmillError::Persistence(e.to_string())
    }
}

/// One position of a cluster pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Token {
    Literal(String),
    /// `key=<*>`: the key is fixed, the value varies.
    Param(String),
    Wildcard,
}

impl Token {
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Self::Literal(_))
    }

    fn render(&self) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::Param(key) => format!("{key}={WILDCARD}"),
            Self::Wildcard => WILDCARD.to_string(),
        }
    }

    /// Generalized form of this position after seeing `incoming`, if it changes.
    fn generalize(&self, incoming: &str) -> Option<Token> {
        match self {
            Self::Literal(s) if s == incoming => None,
            Self::Literal(s) => match (split_pair(s), split_pair(incoming)) {
                (Some((k1, _)), Some((k2, _))) if k1 == k2 => Some(Self::Param(k1.to_string())),
                _ => Some(Self::Wildcard),
            },
            Self::Param(key) => match split_pair(incoming) {
                Some((k, _)) if k == key => None,
                _ => Some(Self::Wildcard),
            },
            Self::Wildcard => None,
        }
    }
}

/// A learned template and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: u64,
    pub token_pattern: Vec<Token>,
    pub token_count: usize,
    pub match_count: u64,
    pub last_seen: DateTime<Utc>,
}

impl Cluster {
    /// Render the current pattern as a template string.
    pub fn template(&self) -> String {
        self.token_pattern
            .iter()
            .map(Token::render)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn wildcard_count(&self) -> usize {
        self.token_pattern.iter().filter(|t| t.is_wildcard()).count()
    }

    /// Fraction of positions matching `tokens`. Wildcards always match.
    fn similarity(&self, tokens: &[&str]) -> f64 {
        if tokens.is_empty() {
            return 1.0;
        }
        let matched = self
            .token_pattern
            .iter()
            .zip(tokens)
            .filter(|(p, t)| match p {
                Token::Literal(s) => s == *t,
                Token::Param(_) | Token::Wildcard => true,
            })
            .count();
        matched as f64 / tokens.len() as f64
    }
}

/// How a `mine` call affected the cluster set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Change {
    Created,
    Generalized,
    Matched,
}

/// Result of mining one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinedTemplate {
    pub template: String,
    pub cluster_id: u64,
    pub change: Change,
}

/// Incremental template miner with an optional on-disk checkpoint.
pub struct TemplateMiner {
    clusters: BTreeMap<u64, Cluster>,
    /// token_count -> cluster ids in creation order.
    buckets: HashMap<usize, Vec<u64>>,
    next_id: u64,
    threshold: f64,
    parametrize_numeric: bool,
    max_clusters: usize,
    store: Option<ClusterStore>,
    on_failure: PersistenceMode,
    checkpoint_interval: u32,
    pending_updates: u32,
    degraded: bool,
}

impl TemplateMiner {
    /// In-memory miner with the given threshold and no checkpointing.
    pub fn new(threshold: f64) -> Self {
        Self {
            clusters: BTreeMap::new(),
            buckets: HashMap::new(),
            next_id: 0,
            threshold,
            parametrize_numeric: false,
            max_clusters: 0,
            store: None,
            on_failure: PersistenceMode::Degrade,
            checkpoint_interval: 1,
            pending_updates: 0,
            degraded: false,
        }
    }

    /// Build a miner from config, reloading any persisted clusters.
    ///
    /// A missing or corrupt store starts empty. An unreadable one starts
    /// empty in degrade mode and fails in halt mode.
    pub fn from_config(config: &MinerConfig) -> Result<Self, MinerError> {
        let mut miner = Self::new(config.similarity_threshold);
        miner.parametrize_numeric = config.parametrize_numeric_tokens;
        miner.max_clusters = config.max_clusters;
        miner.on_failure = config.on_persistence_failure;
        miner.checkpoint_interval = config.checkpoint_interval.max(1);

        let Some(ref path) = config.state_path else {
            return Ok(miner);
        };
        let store = ClusterStore::new(path);

        match store.load() {
            Ok(Some(snapshot)) => {
                miner.restore(snapshot)?;
                info!(
                    "Loaded {} cluster(s) from {}",
                    miner.clusters.len(),
                    store.path().display()
                );
            }
            Ok(None) => debug!("No cluster store at {}, starting empty", store.path().display()),
            Err(e @ StoreError::Corrupt(_)) => {
                warn!("Ignoring cluster store {}: {}", store.path().display(), e);
            }
            Err(e) => match miner.on_failure {
                PersistenceMode::Halt => return Err(e.into()),
                PersistenceMode::Degrade => {
                    warn!("{e}; continuing with in-memory clusters only");
                    miner.degraded = true;
                }
            },
        }

        miner.store = Some(store);
        Ok(miner)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn cluster(&self, id: u64) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    /// Clusters in id order.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// True once a checkpoint failed and persistence was abandoned.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Mine a masked message body, stamping the cluster with the current time.
    pub fn mine(&mut self, body: &str) -> Result<MinedTemplate, MinerError> {
        self.mine_at(body, Utc::now())
    }

    /// Mine a masked message body, stamping the cluster with `seen`.
    pub fn mine_at(&mut self, body: &str, seen: DateTime<Utc>) -> Result<MinedTemplate, MinerError> {
        let tokens: Vec<&str> = body.split_whitespace().collect();

        let mined = match self.best_match(&tokens) {
            Some(id) => self.absorb(id, &tokens, seen),
            None => self.create(&tokens, seen),
        };

        self.after_mutation(mined.change)?;
        Ok(mined)
    }

    /// Best cluster in the token-count bucket at or above the threshold.
    /// Ties prefer more wildcards, then the older cluster.
    fn best_match(&self, tokens: &[&str]) -> Option<u64> {
        let ids = self.buckets.get(&tokens.len())?;
        let mut best: Option<(u64, f64, usize)> = None;

        for id in ids {
            let Some(cluster) = self.clusters.get(id) else {
                continue;
            };
            if cluster.token_count != tokens.len() || cluster.token_pattern.len() != tokens.len() {
                continue;
            }
            let score = cluster.similarity(tokens);
            let params = cluster.wildcard_count();
            let better = match best {
                None => true,
                Some((_, best_score, best_params)) => {
                    score > best_score || (score == best_score && params > best_params)
                }
            };
            if better {
                best = Some((*id, score, params));
            }
        }

        best.filter(|(_, score, _)| *score >= self.threshold)
            .map(|(id, _, _)| id)
    }

    fn absorb(&mut self, id: u64, tokens: &[&str], seen: DateTime<Utc>) -> MinedTemplate {
        let Some(cluster) = self.clusters.get_mut(&id) else {
            return self.create(tokens, seen);
        };
        let mut change = Change::Matched;

        for (slot, incoming) in cluster.token_pattern.iter_mut().zip(tokens) {
            if let Some(general) = slot.generalize(incoming) {
                *slot = general;
                change = Change::Generalized;
            }
        }
        cluster.match_count += 1;
        cluster.last_seen = seen;

        if change == Change::Generalized {
            debug!("Generalized cluster {} -> {}", id, cluster.template());
        }

        MinedTemplate {
            template: cluster.template(),
            cluster_id: id,
            change,
        }
    }

    fn create(&mut self, tokens: &[&str], seen: DateTime<Utc>) -> MinedTemplate {
        if self.max_clusters > 0 && self.clusters.len() >= self.max_clusters {
            self.evict_stalest();
        }

        let id = self.next_id;
        self.next_id += 1;

        let token_pattern = tokens
            .iter()
            .map(|t| self.seed_token(t))
            .collect::<Vec<_>>();
        let cluster = Cluster {
            id,
            token_count: tokens.len(),
            token_pattern,
            match_count: 1,
            last_seen: seen,
        };
        let template = cluster.template();
        debug!("Created cluster {}: {}", id, template);

        self.buckets.entry(tokens.len()).or_default().push(id);
        self.clusters.insert(id, cluster);

        MinedTemplate {
            template,
            cluster_id: id,
            change: Change::Created,
        }
    }

    fn seed_token(&self, token: &str) -> Token {
        if self.parametrize_numeric {
            if is_numeric(token) {
                return Token::Wildcard;
            }
            if let Some((key, value)) = split_pair(token) {
                if is_numeric(value) {
                    return Token::Param(key.to_string());
                }
            }
        }
        Token::Literal(token.to_string())
    }

    fn evict_stalest(&mut self) {
        let Some(victim) = self
            .clusters
            .values()
            .min_by_key(|c| (c.last_seen, c.id))
            .map(|c| (c.id, c.token_count))
        else {
            return;
        };
        let (id, token_count) = victim;

        self.clusters.remove(&id);
        if let Some(ids) = self.buckets.get_mut(&token_count) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.buckets.remove(&token_count);
            }
        }
        debug!("Evicted cluster {}", id);
    }

    /// Structural changes checkpoint immediately, count-only updates every
    /// `checkpoint_interval` calls.
    fn after_mutation(&mut self, change: Change) -> Result<(), MinerError> {
        self.pending_updates += 1;
        let due = change != Change::Matched || self.pending_updates >= self.checkpoint_interval;
        if due {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Write the current cluster set to the store, if one is configured.
    pub fn checkpoint(&mut self) -> Result<(), MinerError> {
        if self.degraded {
            return Ok(());
        }
        let Some(store) = self.store.as_ref() else {
            self.pending_updates = 0;
            return Ok(());
        };

        let snapshot = self.snapshot();
        let mut attempt = 1;
        let result = loop {
            match store.save(&snapshot) {
                Ok(()) => break Ok(()),
                Err(e) if attempt < CHECKPOINT_ATTEMPTS => {
                    debug!("Checkpoint attempt {} failed: {}", attempt, e);
                    thread::sleep(Duration::from_millis(CHECKPOINT_BACKOFF_MS << (attempt - 1)));
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.pending_updates = 0;
                debug!(
                    "Checkpointed {} cluster(s) to {}",
                    snapshot.clusters.len(),
                    store.path().display()
                );
                Ok(())
            }
            Err(e) => match self.on_failure {
                PersistenceMode::Halt => Err(e.into()),
                PersistenceMode::Degrade => {
                    warn!("{e}; continuing with in-memory clusters only");
                    self.degraded = true;
                    Ok(())
                }
            },
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: STORE_VERSION,
            next_id: self.next_id,
            clusters: self.clusters.values().cloned().collect(),
        }
    }

    /// Replace the index with a snapshot's contents.
    ///
    /// An inconsistent snapshot is rejected and leaves the index untouched.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), StoreError> {
        snapshot.validate()?;
        self.clusters.clear();
        self.buckets.clear();
        self.next_id = snapshot.next_id;

        for cluster in snapshot.clusters {
            self.next_id = self.next_id.max(cluster.id + 1);
            self.buckets
                .entry(cluster.token_count)
                .or_default()
                .push(cluster.id);
            self.clusters.insert(cluster.id, cluster);
        }
        for ids in self.buckets.values_mut() {
            ids.sort_unstable();
        }
        Ok(())
    }
}

/// Digits with optional `.`/`,` separators, e.g. `42`, `50.00`, `1,024`.
fn is_numeric(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
        && token.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle serializing all access to one miner.
///
/// Every `mine` holds the lock across best-match lookup, generalization and
/// checkpoint, so concurrent pipelines never observe a half-updated cluster.
#[derive(Clone)]
pub struct MinerHandle {
    inner: Arc<Mutex<TemplateMiner>>,
}

impl MinerHandle {
    pub fn new(miner: TemplateMiner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(miner)),
        }
    }

    pub fn mine(&self, body: &str) -> Result<MinedTemplate, MinerError> {
        self.lock().mine(body)
    }

    pub fn checkpoint(&self) -> Result<(), MinerError> {
        self.lock().checkpoint()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    pub fn cluster_count(&self) -> usize {
        self.lock().cluster_count()
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().is_degraded()
    }

    fn lock(&self) -> MutexGuard<'_, TemplateMiner> {
        // A panic mid-mine leaves at worst a partially generalized cluster,
        // which is still a valid cluster.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
