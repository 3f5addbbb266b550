use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use super::FeedbackEvent;

/// Errors from the feedback store and the state persistence helpers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store task was cancelled")]
    TaskCancelled,
}

/// Aggregate view over stored feedback events.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StoreStats {
    pub total_events: u64,
    pub by_variant: BTreeMap<String, u64>,
    pub by_profile: BTreeMap<String, u64>,
    pub latest_ts_hour: Option<u64>,
}

/// Append-only persistent log of anonymized feedback events.
///
/// One JSON record per line; appends are serialized and fsynced before the
/// call returns, so a record that was acknowledged survives a crash. The
/// store never mutates past records; `cleanup` is the only operation that
/// removes anything, and it rewrites atomically.
pub struct FeedbackStore {
    path: PathBuf,
    /// Serializes writers at the append boundary.
    write_lock: tokio::sync::Mutex<()>,
}

impl FeedbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Durable (written and fsynced) before returning.
    ///
    /// Records that fail validation are rejected and never touch the disk.
    pub async fn append(&self, event: &FeedbackEvent) -> Result<(), StoreError> {
        event.validate().map_err(StoreError::Validation)?;

        let line = serde_json::to_string(event)?;
        let path = self.path.clone();

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || append_line_durable(&path, &line))
            .await
            .map_err(|_| StoreError::TaskCancelled)??;

        crate::metrics::record_feedback_stored();
        Ok(())
    }

    /// Aggregate stats over events at or after `since_ts_hour`.
    pub async fn stats(&self, since_ts_hour: u64) -> Result<StoreStats, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_stats(&path, since_ts_hour))
            .await
            .map_err(|_| StoreError::TaskCancelled)?
    }

    /// Remove events strictly older than `older_than_ts_hour`.
    ///
    /// Rewrites the retained suffix to a temp file and renames it into
    /// place. Returns the number of removed records.
    pub async fn cleanup(&self, older_than_ts_hour: u64) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let _guard = self.write_lock.lock().await;
        let removed = tokio::task::spawn_blocking(move || rewrite_retained(&path, older_than_ts_hour))
            .await
            .map_err(|_| StoreError::TaskCancelled)??;
        if removed > 0 {
            info!(removed, "feedback retention cleanup");
        }
        Ok(removed)
    }
}

fn append_line_durable(path: &Path, line: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

fn read_events(path: &Path) -> Result<Vec<FeedbackEvent>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedbackEvent>(&line) {
            Ok(event) => events.push(event),
            // A torn trailing line after a crash is skipped, not fatal
            Err(e) => warn!("skipping unreadable feedback record: {e}"),
        }
    }
    Ok(events)
}

fn read_stats(path: &Path, since_ts_hour: u64) -> Result<StoreStats, StoreError> {
    let mut stats = StoreStats::default();
    for event in read_events(path)? {
        if event.ts_hour < since_ts_hour {
            continue;
        }
        stats.total_events += 1;
        *stats
            .by_variant
            .entry(event.policy_variant_id.clone())
            .or_insert(0) += 1;
        *stats.by_profile.entry(event.profile.clone()).or_insert(0) += 1;
        stats.latest_ts_hour = Some(stats.latest_ts_hour.unwrap_or(0).max(event.ts_hour));
    }
    Ok(stats)
}

fn rewrite_retained(path: &Path, older_than_ts_hour: u64) -> Result<u64, StoreError> {
    let events = read_events(path)?;
    if events.is_empty() {
        return Ok(0);
    }
    let retained: Vec<&FeedbackEvent> = events
        .iter()
        .filter(|e| e.ts_hour >= older_than_ts_hour)
        .collect();
    let removed = (events.len() - retained.len()) as u64;
    if removed == 0 {
        return Ok(0);
    }

    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        for event in &retained {
            serde_json::to_writer(&mut file, event)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(removed)
}

/// Bounded in-memory buffer of rewards whose persistence failed.
///
/// The call never blocks on a broken disk: the reward is parked here and a
/// background task retries on a backoff; whatever is still parked at
/// shutdown gets one final flush attempt.
pub struct RewardOutbox {
    entries: Mutex<VecDeque<(String, f64)>>,
    capacity: usize,
}

impl RewardOutbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Park a reward for retry. The oldest entry gives way when full.
    pub fn park(&self, variant_id: String, reward: f64) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            let dropped = entries.pop_front();
            if let Some((variant, _)) = dropped {
                warn!(variant, "reward outbox full, dropped oldest entry");
            }
        }
        entries.push_back((variant_id, reward));
        crate::metrics::record_reward_parked();
    }

    /// Take everything currently parked.
    pub fn drain(&self) -> Vec<(String, f64)> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RewardOutbox {
    fn default() -> Self {
        Self::new(256)
    }
}
