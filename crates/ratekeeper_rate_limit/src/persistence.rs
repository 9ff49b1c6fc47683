//! Persistence sinks for quota state.
//!
//! A sink stores opaque JSON blobs keyed by `(provider, target, period_id)`.
//! The quota tracker reads them on startup and writes them on an interval
//! and at shutdown.

use fs2::FileExt;
use parking_lot::Mutex;
use ratekeeper_error::{RatekeeperResult, StateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// One persisted quota state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBlob {
    /// Provider name
    pub provider: String,
    /// Model or deployment name
    pub target: String,
    /// Quota period the state belongs to
    pub period_id: String,
    /// Opaque state
    pub state: Value,
}

impl PersistedBlob {
    fn same_slot(&self, other: &PersistedBlob) -> bool {
        self.provider == other.provider
            && self.target == other.target
            && self.period_id == other.period_id
    }
}

/// Durable storage for quota state.
pub trait PersistenceSink: Send + Sync + fmt::Debug {
    /// Every stored blob.
    fn load_all(&self) -> RatekeeperResult<Vec<PersistedBlob>>;

    /// Insert or replace `blobs`; blobs for other keys are kept.
    fn store(&self, blobs: &[PersistedBlob]) -> RatekeeperResult<()>;
}

fn merge(existing: &mut Vec<PersistedBlob>, blobs: &[PersistedBlob]) {
    for blob in blobs {
        match existing.iter_mut().find(|b| b.same_slot(blob)) {
            Some(slot) => *slot = blob.clone(),
            None => existing.push(blob.clone()),
        }
    }
}

/// Sink that keeps blobs in memory (tests, or a process that restarts
/// without needing history).
#[derive(Debug, Default)]
pub struct InMemorySink {
    blobs: Mutex<Vec<PersistedBlob>>,
}

impl InMemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceSink for InMemorySink {
    fn load_all(&self) -> RatekeeperResult<Vec<PersistedBlob>> {
        Ok(self.blobs.lock().clone())
    }

    fn store(&self, blobs: &[PersistedBlob]) -> RatekeeperResult<()> {
        merge(&mut self.blobs.lock(), blobs);
        Ok(())
    }
}

/// Sink backed by a single JSON file.
///
/// Writers from several processes are serialised with an exclusive lock on
/// `<path>.lock`; the file is replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    /// Persist to `path`. The file does not need to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> RatekeeperResult<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StateError::io(parent.display(), e))?;
            }
        }
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StateError::io(lock_path.display(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::io(lock_path.display(), e))?;
        Ok(file)
    }

    fn read(&self) -> RatekeeperResult<Vec<PersistedBlob>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StateError::serialization(self.path.display().to_string(), e).into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StateError::io(self.path.display(), e).into()),
        }
    }
}

impl PersistenceSink for JsonFileSink {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load_all(&self) -> RatekeeperResult<Vec<PersistedBlob>> {
        let _lock = self.lock()?;
        let blobs = self.read()?;
        debug!(count = blobs.len(), "Loaded persisted quota state");
        Ok(blobs)
    }

    #[instrument(skip(self, blobs), fields(path = %self.path.display(), count = blobs.len()))]
    fn store(&self, blobs: &[PersistedBlob]) -> RatekeeperResult<()> {
        let _lock = self.lock()?;
        let mut all = self.read()?;
        merge(&mut all, blobs);

        let bytes = serde_json::to_vec_pretty(&all)
            .map_err(|e| StateError::serialization(self.path.display().to_string(), e))?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(|e| StateError::io(tmp.display(), e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StateError::io(tmp.display(), e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StateError::io(self.path.display(), e))?;
        debug!("Persisted quota state");
        Ok(())
    }
}
