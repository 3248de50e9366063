//! Whole-collection JSON persistence with atomic replace.
//!
//! Each collection lives in one pretty-printed JSON array. A write serializes
//! the full collection into a temp file next to the target, fsyncs it, and
//! renames it over the target, so the active file is always the last complete
//! snapshot. Stray temp files left by a crash are ignored on load.
//!
//! Several processes may share one data directory. Writers hold
//! [`DataDirLock`] while they re-read, modify and replace a collection, so no
//! process saves over records it has not seen.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{Result, WorkflowError};

pub const WORKFLOWS_FILE: &str = "workflows.json";
pub const EVENTS_FILE: &str = "workflow_events.json";
pub const LOCKS_FILE: &str = "workflow_locks.json";
pub const TASKS_FILE: &str = "tasks.json";
pub const WORKSPACES_FILE: &str = "workspaces.json";
pub const DATA_LOCK_FILE: &str = ".cowork.lock";

/// Exclusive advisory lock on a data directory, released on drop.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
}

impl DataDirLock {
    /// Block until the lock on `data_dir` is ours.
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DATA_LOCK_FILE);
        let persistence = |source: std::io::Error| WorkflowError::Persistence {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(persistence)?;
        file.lock_exclusive().map_err(persistence)?;
        Ok(Self { file })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Load a collection. A missing file is an empty collection.
pub fn load_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(WorkflowError::Persistence {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Atomically replace `path` with the serialized collection.
pub fn save_collection<'a, T, I>(path: &Path, items: I) -> Result<()>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let items: Vec<&T> = items.into_iter().collect();
    let payload = serde_json::to_vec_pretty(&items)?;
    let persistence = |source: std::io::Error| WorkflowError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".cowork-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(persistence)?;
    temp.write_all(&payload).map_err(persistence)?;
    temp.as_file().sync_all().map_err(persistence)?;
    temp.persist(path).map_err(|e| persistence(e.error))?;
    Ok(())
}
