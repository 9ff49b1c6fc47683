//! Shared limiter state for threads and processes.
//!
//! Every piece of mutable limiter state (window entries, in-flight counters,
//! quota counters) lives in a [`StateBackend`] under a string key derived
//! from [`LimitKey`]. The [`ParallelCoordinator`] serialises access per key:
//!
//! - in-process, with one re-entrant mutex per key
//! - across processes, with whatever lock the backend provides (an exclusive
//!   `flock` on a per-key lock file for [`FileBackend`])
//!
//! Multi-key updates lock keys in sorted order, so two callers admitting
//! against overlapping limit sets cannot deadlock. Locks are held only while
//! the state closure runs; callers never hold them across a provider call or
//! a sleep.
//!
//! There is no global instance: construct one coordinator per process group
//! and hand clones to every limiter component that needs it.

use fs2::FileExt;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use ratekeeper_core::LimitKey;
use ratekeeper_error::{RatekeeperResult, StateError, StateErrorKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Cross-process lock held while a key's state is read and written.
///
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct BackendGuard {
    _file: Option<File>,
}

impl BackendGuard {
    /// A guard that holds nothing (for backends with no cross-process lock).
    pub fn none() -> Self {
        Self { _file: None }
    }

    /// A guard that keeps `file` (and its advisory lock) alive.
    pub fn file(file: File) -> Self {
        Self { _file: Some(file) }
    }
}

/// Storage for per-key state blobs.
pub trait StateBackend: Send + Sync + fmt::Debug {
    /// Take the cross-process lock for `key`.
    fn lock(&self, key: &str) -> RatekeeperResult<BackendGuard>;

    /// Read the blob for `key`. Only called while the key is locked.
    fn load(&self, key: &str) -> RatekeeperResult<Option<Value>>;

    /// Replace the blob for `key`. Only called while the key is locked.
    fn store(&self, key: &str, value: &Value) -> RatekeeperResult<()>;
}

/// State shared by the threads of one process.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    blobs: Mutex<HashMap<String, Value>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for InMemoryBackend {
    fn lock(&self, _key: &str) -> RatekeeperResult<BackendGuard> {
        Ok(BackendGuard::none())
    }

    fn load(&self, key: &str) -> RatekeeperResult<Option<Value>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &Value) -> RatekeeperResult<()> {
        self.blobs.lock().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// State shared by every process pointed at the same directory.
///
/// Each key maps to `<sha256(key)>.json` plus a `<sha256(key)>.lock` file
/// that is exclusively locked while the state is read and rewritten. Blobs
/// are written to a temporary file and renamed into place.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir` for state, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn new(dir: impl AsRef<Path>) -> RatekeeperResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StateError::io(dir.display(), e))?;
        debug!("Using file-backed shared state");
        Ok(Self { dir })
    }

    /// Directory holding the state files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::stem(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", Self::stem(key)))
    }
}

impl StateBackend for FileBackend {
    fn lock(&self, key: &str) -> RatekeeperResult<BackendGuard> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateError::io(path.display(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::io(path.display(), e))?;
        Ok(BackendGuard::file(file))
    }

    fn load(&self, key: &str) -> RatekeeperResult<Option<Value>> {
        let path = self.data_path(key);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StateError::serialization(key, e).into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(path.display(), e).into()),
        }
    }

    fn store(&self, key: &str, value: &Value) -> RatekeeperResult<()> {
        let path = self.data_path(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(value).map_err(|e| StateError::serialization(key, e))?;
        let mut file = File::create(&tmp).map_err(|e| StateError::io(tmp.display(), e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StateError::io(tmp.display(), e))?;
        fs::rename(&tmp, &path).map_err(|e| StateError::io(path.display(), e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SlotState {
    depth: usize,
    guard: Option<BackendGuard>,
}

/// Per-key re-entrant lock. The backend lock is taken on first entry and
/// released when the outermost holder leaves.
#[derive(Debug, Default)]
struct KeySlot {
    inner: ReentrantMutex<RefCell<SlotState>>,
}

struct HeldKey<'a> {
    held: ReentrantMutexGuard<'a, RefCell<SlotState>>,
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        let mut state = self.held.borrow_mut();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.guard = None;
        }
    }
}

/// Process-shared state container with per-key locking.
///
/// Cloning is cheap; clones share locks and backend.
#[derive(Clone)]
pub struct ParallelCoordinator {
    backend: Arc<dyn StateBackend>,
    slots: Arc<Mutex<HashMap<String, Arc<KeySlot>>>>,
}

impl fmt::Debug for ParallelCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelCoordinator")
            .field("backend", &self.backend)
            .field("keys", &self.slots.lock().len())
            .finish()
    }
}

impl ParallelCoordinator {
    /// Coordinate through `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            slots: Arc::default(),
        }
    }

    /// Coordinator for threads of a single process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Coordinator for every process sharing `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn file_backed(dir: impl AsRef<Path>) -> RatekeeperResult<Self> {
        Ok(Self::new(Arc::new(FileBackend::new(dir)?)))
    }

    /// Storage key for a limit's state.
    pub fn state_key(key: &LimitKey) -> String {
        key.to_string()
    }

    fn slot(&self, key: &str) -> Arc<KeySlot> {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn enter<'a>(
        &self,
        slot: &'a KeySlot,
        key: &str,
        exclusive: bool,
    ) -> RatekeeperResult<HeldKey<'a>> {
        let held = slot.inner.lock();
        {
            let mut state = held.borrow_mut();
            if exclusive && state.depth > 0 {
                return Err(StateError::new(StateErrorKind::NestedWrite(key.to_string())).into());
            }
            if state.depth == 0 {
                state.guard = Some(self.backend.lock(key)?);
            }
            state.depth += 1;
        }
        Ok(HeldKey { held })
    }

    /// Run `f` on the state stored under `key` while holding its lock, then
    /// write the state back. Missing state starts from `T::default()`.
    ///
    /// Updates do not nest: calling `with_state` or `with_states` for `key`
    /// from inside `f` fails with [`StateErrorKind::NestedWrite`], since the
    /// outer write-back would discard the inner one. [`snapshot`](Self::snapshot)
    /// may be called from inside `f` and sees the last stored value, not
    /// the one `f` is building.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, read, decoded or
    /// written, or if `key` is already being updated on this thread.
    pub fn with_state<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> RatekeeperResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        self.with_states(&[key.to_string()], |states: &mut [T]| f(&mut states[0]))
    }

    /// Run `f` on the states of several keys atomically.
    ///
    /// Keys are locked in sorted order; `states` is passed to `f` in the
    /// order of `keys`. The nesting rules of [`with_state`](Self::with_state)
    /// apply to every key.
    ///
    /// # Errors
    ///
    /// Returns an error if any state cannot be locked, read, decoded or
    /// written, if a key appears twice, or if a key is already being updated
    /// on this thread.
    pub fn with_states<T, R>(
        &self,
        keys: &[String],
        f: impl FnOnce(&mut [T]) -> R,
    ) -> RatekeeperResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let mut order: Vec<&String> = keys.iter().collect();
        order.sort();
        if let Some(pair) = order.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(StateError::new(StateErrorKind::DuplicateKey(pair[0].clone())).into());
        }

        let slots: Vec<(&String, Arc<KeySlot>)> =
            order.iter().map(|k| (*k, self.slot(k))).collect();
        let mut held = Vec::with_capacity(slots.len());
        for (key, slot) in &slots {
            held.push(self.enter(slot, key, true)?);
        }
        trace!(keys = keys.len(), "Locked shared state");

        let mut states = keys
            .iter()
            .map(|key| self.read(key))
            .collect::<RatekeeperResult<Vec<T>>>()?;

        let result = f(&mut states);

        for (key, state) in keys.iter().zip(&states) {
            let value = serde_json::to_value(state).map_err(|e| StateError::serialization(key, e))?;
            self.backend.store(key, &value)?;
        }
        drop(held);
        Ok(result)
    }

    /// Read the state under `key` while holding its lock, without writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, read or decoded.
    pub fn snapshot<T>(&self, key: &str) -> RatekeeperResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let slot = self.slot(key);
        let _held = self.enter(&slot, key, false)?;
        self.backend
            .load(key)?
            .map(|value| serde_json::from_value(value).map_err(|e| StateError::serialization(key, e).into()))
            .transpose()
    }

    fn read<T>(&self, key: &str) -> RatekeeperResult<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.backend.load(key)? {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| StateError::serialization(key, e).into())
            }
            None => Ok(T::default()),
        }
    }
}

impl Default for ParallelCoordinator {
    fn default() -> Self {
        Self::in_memory()
    }
}
