//! ID allocation shared by workflows, tasks and workspaces.
//!
//! Workflows and tasks draw from one shared counter. Standalone workspaces
//! draw from a second counter starting at [`WORKSPACE_ID_SEED`]; a workspace
//! created for a task takes the task's ID instead, so task-owned workspaces are
//! recognizable by `workspace.id == task.id`.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Deserialize;

use super::persist::{TASKS_FILE, WORKFLOWS_FILE, WORKSPACES_FILE, load_collection};
use crate::errors::Result;

/// First ID handed out for standalone workspaces.
pub const WORKSPACE_ID_SEED: i64 = 1_000_000;

#[derive(Debug)]
pub struct IdAllocator {
    shared: AtomicI64,
    workspace: AtomicI64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::with_seeds(1, WORKSPACE_ID_SEED)
    }

    /// Start both counters at explicit values (tests, restored state).
    pub fn with_seeds(next_shared: i64, next_workspace: i64) -> Self {
        Self {
            shared: AtomicI64::new(next_shared),
            workspace: AtomicI64::new(next_workspace),
        }
    }

    /// Next workflow/task ID.
    pub fn next_shared(&self) -> i64 {
        self.shared.fetch_add(1, Ordering::SeqCst)
    }

    /// Next standalone workspace ID.
    pub fn next_workspace(&self) -> i64 {
        self.workspace.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure the shared counter never reissues `id`.
    pub fn observe_shared(&self, id: i64) {
        self.shared.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Make sure the workspace counter never reissues `id`. IDs below the
    /// seed belong to task-owned workspaces and don't move the counter.
    pub fn observe_workspace(&self, id: i64) {
        if id >= WORKSPACE_ID_SEED {
            self.workspace.fetch_max(id + 1, Ordering::SeqCst);
        }
    }

    pub fn peek_shared(&self) -> i64 {
        self.shared.load(Ordering::SeqCst)
    }

    /// Catch both counters up with every ID already written under `data_dir`,
    /// including records saved by other processes. Call it while holding the
    /// data directory lock, right before allocating.
    pub fn observe_data_dir(&self, data_dir: &Path) -> Result<()> {
        for file in [WORKFLOWS_FILE, TASKS_FILE] {
            let rows: Vec<IdOnly> = load_collection(&data_dir.join(file))?;
            for row in rows {
                self.observe_shared(row.id);
            }
        }
        let workspaces: Vec<IdOnly> = load_collection(&data_dir.join(WORKSPACES_FILE))?;
        for ws in workspaces {
            self.observe_workspace(ws.id);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct IdOnly {
    id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_counter_is_monotonic() {
        let ids = IdAllocator::new();
        let a = ids.next_shared();
        let b = ids.next_shared();
        let c = ids.next_shared();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_workspace_counter_starts_at_seed() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_workspace(), WORKSPACE_ID_SEED);
        assert_eq!(ids.next_workspace(), WORKSPACE_ID_SEED + 1);
        // Shared counter untouched.
        assert_eq!(ids.next_shared(), 1);
    }

    #[test]
    fn test_observe_skips_past_existing_ids() {
        let ids = IdAllocator::new();
        ids.observe_shared(41);
        assert_eq!(ids.next_shared(), 42);
        // Observing a lower ID never rewinds.
        ids.observe_shared(5);
        assert_eq!(ids.next_shared(), 43);
    }

    #[test]
    fn test_observe_workspace_ignores_task_owned_ids() {
        let ids = IdAllocator::new();
        ids.observe_workspace(17);
        assert_eq!(ids.next_workspace(), WORKSPACE_ID_SEED);
        ids.observe_workspace(WORKSPACE_ID_SEED + 9);
        assert_eq!(ids.next_workspace(), WORKSPACE_ID_SEED + 10);
    }

    #[test]
    fn test_observe_data_dir_reads_every_collection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WORKFLOWS_FILE), r#"[{"id": 4, "state": "queued"}]"#)
            .unwrap();
        std::fs::write(dir.path().join(TASKS_FILE), r#"[{"id": 9}]"#).unwrap();
        std::fs::write(
            dir.path().join(WORKSPACES_FILE),
            format!(r#"[{{"id": 9}}, {{"id": {}}}]"#, WORKSPACE_ID_SEED + 2),
        )
        .unwrap();

        let ids = IdAllocator::new();
        ids.observe_data_dir(dir.path()).unwrap();
        assert_eq!(ids.next_shared(), 10);
        assert_eq!(ids.next_workspace(), WORKSPACE_ID_SEED + 3);
    }

    #[test]
    fn test_concurrent_allocation_yields_unique_ids() {
        let ids = std::sync::Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..100).map(|_| ids.next_shared()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }
}
