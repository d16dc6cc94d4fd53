//! Durable document store for build state and idempotency keys.
//!
//! Two implementations: an in-memory store for tests and short-lived runs,
//! and a filesystem store that survives process restarts. The filesystem
//! store serializes writers through an advisory file lock and writes every
//! document atomically (temp file + rename), so a crash mid-write never
//! leaves a torn state file.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::BuildState;

const LOCK_FILE: &str = ".state.lock";

/// Persistence interface for build state and artifact idempotency keys.
///
/// `record_idempotency_key` must be durable before it returns: a key that was
/// ever observed as recorded stays recorded across a crash.
pub trait DocumentStore: Send + Sync {
    fn persist(&self, state: &BuildState) -> Result<()>;
    fn load_build_state(&self, build_id: &str) -> Result<Option<BuildState>>;
    fn list_incomplete_builds(&self) -> Result<Vec<BuildState>>;
    fn has_idempotency_key(&self, key: &str) -> Result<bool>;
    fn record_idempotency_key(&self, key: &str) -> Result<()>;
    /// Remove all state and keys for a build after explicit cleanup.
    fn clear_job(&self, build_id: &str) -> Result<()>;
}

/// Volatile store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    builds: Mutex<HashMap<String, BuildState>>,
    keys: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn persist(&self, state: &BuildState) -> Result<()> {
        self.builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.build_id.clone(), state.clone());
        Ok(())
    }

    fn load_build_state(&self, build_id: &str) -> Result<Option<BuildState>> {
        Ok(self
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(build_id)
            .cloned())
    }

    fn list_incomplete_builds(&self) -> Result<Vec<BuildState>> {
        Ok(self
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| !s.terminal)
            .cloned()
            .collect())
    }

    fn has_idempotency_key(&self, key: &str) -> Result<bool> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key))
    }

    fn record_idempotency_key(&self, key: &str) -> Result<()> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
        Ok(())
    }

    fn clear_job(&self, build_id: &str) -> Result<()> {
        self.builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(build_id);
        let prefix = format!("{build_id}:");
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k| !k.starts_with(&prefix));
        Ok(())
    }
}

/// Filesystem store under a root directory.
///
/// Layout: `builds/{build_id}.json` for state documents, `keys/{build_id}.keys`
/// as an append-only line file of recorded idempotency keys. Keys are cached
/// in memory after first read; appends go through the cache and the file.
pub struct FsStore {
    root: PathBuf,
    key_cache: Mutex<HashMap<String, HashSet<String>>>,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("builds"))
            .with_context(|| format!("Failed to create store directory: {}", root.display()))?;
        fs::create_dir_all(root.join("keys"))?;
        Ok(Self {
            root,
            key_cache: Mutex::new(HashMap::new()),
        })
    }

    fn build_path(&self, build_id: &str) -> PathBuf {
        self.root.join("builds").join(format!("{build_id}.json"))
    }

    fn keys_path(&self, build_id: &str) -> PathBuf {
        self.root.join("keys").join(format!("{build_id}.keys"))
    }

    /// Acquire the store-wide write lock, run `f`, release on return.
    fn with_write_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_path = self.root.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| anyhow::anyhow!("Failed to acquire state write lock: {e}"))?;
        f()
    }

    fn loaded_keys(&self, build_id: &str) -> Result<HashSet<String>> {
        let mut cache = self.key_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(keys) = cache.get(build_id) {
            return Ok(keys.clone());
        }
        let path = self.keys_path(build_id);
        let keys: HashSet<String> = match fs::read_to_string(&path) {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read keys: {}", path.display()));
            }
        };
        cache.insert(build_id.to_string(), keys.clone());
        Ok(keys)
    }
}

/// The build id is the key prefix up to the first `:`.
fn build_id_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

impl DocumentStore for FsStore {
    fn persist(&self, state: &BuildState) -> Result<()> {
        self.with_write_lock(|| {
            let data = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;
            atomic_write(&self.build_path(&state.build_id), &data)
        })
    }

    fn load_build_state(&self, build_id: &str) -> Result<Option<BuildState>> {
        let path = self.build_path(build_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state: {}", path.display()));
            }
        };
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("Corrupt state file: {}", path.display()))?;
        Ok(Some(state))
    }

    fn list_incomplete_builds(&self) -> Result<Vec<BuildState>> {
        let dir = self.root.join("builds");
        let mut incomplete = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to list builds: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            let state: BuildState = serde_json::from_str(&contents)
                .with_context(|| format!("Corrupt state file: {}", path.display()))?;
            if !state.terminal {
                incomplete.push(state);
            }
        }
        incomplete.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(incomplete)
    }

    fn has_idempotency_key(&self, key: &str) -> Result<bool> {
        Ok(self.loaded_keys(build_id_of(key))?.contains(key))
    }

    fn record_idempotency_key(&self, key: &str) -> Result<()> {
        let build_id = build_id_of(key).to_string();
        self.with_write_lock(|| {
            if self.loaded_keys(&build_id)?.contains(key) {
                return Ok(());
            }
            let path = self.keys_path(&build_id);
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{key}")?;
            file.sync_all()
                .with_context(|| format!("Failed to sync keys: {}", path.display()))?;
            self.key_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(build_id.clone())
                .or_default()
                .insert(key.to_string());
            Ok(())
        })
    }

    fn clear_job(&self, build_id: &str) -> Result<()> {
        self.with_write_lock(|| {
            for path in [self.build_path(build_id), self.keys_path(build_id)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to remove: {}", path.display()));
                    }
                }
            }
            self.key_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(build_id);
            Ok(())
        })
    }
}

/// Write data to a file atomically using temp-file + rename.
fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target.parent().context("Target path has no parent")?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(data).context("Failed to write temp file")?;
    tmp.as_file().sync_all().context("Failed to sync temp file")?;
    tmp.persist(target)
        .with_context(|| format!("Failed to persist to {}", target.display()))?;
    Ok(())
}
