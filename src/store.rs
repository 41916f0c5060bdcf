//! Durable local storage of run records.
//!
//! All records live in one JSON array on disk, most-recently-saved first. The
//! store never surfaces read failures: a missing, unreadable, or corrupt file
//! reads as an empty store.
//!
//! Several processes may share one store. Every read-modify-write cycle holds
//! an exclusive advisory lock on a `<store>.lock` sidecar, and the file itself
//! is replaced atomically, so plain reads never need the lock.

use crate::model::RunRecord;
use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STORE_FILE: &str = "runs.json";

#[derive(Clone)]
pub struct RunStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl RunStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// `<data_local_dir>/veritas-pytest/runs.json`
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .context("could not determine a data directory for the run store")?;
        Ok(base.join("veritas-pytest").join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Upsert by run id. The saved record moves to the front of the listing.
    ///
    /// Write failures are logged and swallowed; the caller keeps its in-memory copy.
    pub fn save(&self, record: &RunRecord) {
        let _guard = self.inner.lock.lock();
        let _file_lock = self.lock_file();
        let runs = self.read_all();
        self.upsert(runs, record);
    }

    /// Like [`save`](Self::save), unless the stored copy has already finished.
    ///
    /// Returns that finished copy instead of writing. The check and the write
    /// happen under one lock, so a run finished by another process stays finished.
    pub fn save_unless_finished(&self, record: &RunRecord) -> Option<RunRecord> {
        let _guard = self.inner.lock.lock();
        let _file_lock = self.lock_file();
        let runs = self.read_all();
        if let Some(stored) = runs
            .iter()
            .find(|r| r.run_id == record.run_id && r.status.is_terminal())
        {
            return Some(stored.clone());
        }
        self.upsert(runs, record);
        None
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        let _guard = self.inner.lock.lock();
        self.read_all().into_iter().find(|r| r.run_id == run_id)
    }

    /// Every stored record, most-recently-saved first. Empty on first use.
    pub fn list_all(&self) -> Vec<RunRecord> {
        let _guard = self.inner.lock.lock();
        self.read_all()
    }

    pub fn is_empty(&self) -> bool {
        self.list_all().is_empty()
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, run_id: &str) -> bool {
        let _guard = self.inner.lock.lock();
        let _file_lock = self.lock_file();
        let mut runs = self.read_all();
        let before = runs.len();
        runs.retain(|r| r.run_id != run_id);
        if runs.len() == before {
            return false;
        }
        if let Err(e) = self.write_all(&runs) {
            tracing::warn!(run_id, "failed to persist deletion: {e:#}");
            return false;
        }
        true
    }

    /// Exclusive lock shared with other processes, released when the file drops.
    ///
    /// A lock that cannot be taken is logged and the write goes ahead unguarded.
    fn lock_file(&self) -> Option<File> {
        match acquire_lock(&self.inner.path.with_extension("json.lock")) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("run store lock unavailable: {e:#}");
                None
            }
        }
    }

    fn upsert(&self, mut runs: Vec<RunRecord>, record: &RunRecord) {
        runs.retain(|r| r.run_id != record.run_id);
        runs.insert(0, record.clone());
        if let Err(e) = self.write_all(&runs) {
            tracing::warn!(run_id = %record.run_id, "failed to persist run: {e:#}");
        }
    }

    fn read_all(&self) -> Vec<RunRecord> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.inner.path.display(), "run store unreadable: {e}");
                return Vec::new();
            }
        };
        if raw.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<RunRecord>>(&raw) {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(path = %self.inner.path.display(), "run store is corrupt, treating as empty: {e}");
                Vec::new()
            }
        }
    }

    fn write_all(&self, runs: &[RunRecord]) -> Result<()> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(runs)?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }
}

fn acquire_lock(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("lock {}", lock_path.display()))?;
    Ok(file)
}

/// Write one record as pretty JSON to a user-chosen path.
pub fn export_json(path: &Path, record: &RunRecord) -> Result<()> {
    let data = serde_json::to_vec_pretty(record)?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Write the run's patch text to a user-chosen path.
pub fn export_patch(path: &Path, record: &RunRecord) -> Result<()> {
    if record.patch_diff.is_empty() {
        anyhow::bail!("run {} has no patch yet", record.run_id);
    }
    std::fs::write(path, &record.patch_diff).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// `veritas-pytest-<runId>.diff`
pub fn default_patch_file_name(run_id: &str) -> String {
    format!("veritas-pytest-{run_id}.diff")
}
