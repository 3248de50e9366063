use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::models::{NewWorkspace, Workspace};
use crate::workflow::ids::IdAllocator;
use crate::workflow::persist::{DataDirLock, WORKSPACES_FILE, load_collection, save_collection};

#[async_trait]
pub trait WorkspaceService: Send + Sync {
    /// Register the workspace owned by `task_id`. Its ID is the task ID;
    /// calling again for the same task returns the existing record.
    async fn create_workspace_for_task(&self, task_id: i64, ws: NewWorkspace) -> Result<Workspace>;

    /// Register a standalone workspace with an ID from the workspace counter.
    async fn create_workspace(&self, ws: NewWorkspace) -> Result<Workspace>;

    async fn get_workspace(&self, id: i64) -> Result<Option<Workspace>>;

    /// Remove the record and its directory.
    async fn delete_workspace(&self, id: i64) -> Result<()>;
}

/// JSON-file backed workspace registry. Each workspace gets `<root>/ws-<id>`;
/// the directory itself is created by whoever clones into it. Like the task
/// store, every call re-reads the file and writes hold the data directory lock.
pub struct WorkspaceStore {
    workspaces: Mutex<BTreeMap<i64, Workspace>>,
    data_dir: PathBuf,
    path: PathBuf,
    root: PathBuf,
    ids: Arc<IdAllocator>,
}

impl WorkspaceStore {
    pub fn open(data_dir: &Path, root: &Path, ids: Arc<IdAllocator>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        let store = Self {
            workspaces: Mutex::new(BTreeMap::new()),
            data_dir: data_dir.to_path_buf(),
            path: data_dir.join(WORKSPACES_FILE),
            root: root.to_path_buf(),
            ids,
        };
        drop(store.current()?);
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn current(&self) -> Result<MutexGuard<'_, BTreeMap<i64, Workspace>>> {
        let mut workspaces = self
            .workspaces
            .lock()
            .map_err(|_| anyhow!("workspace store lock poisoned"))?;
        let loaded: Vec<Workspace> = load_collection(&self.path)
            .with_context(|| format!("Failed to load {}", self.path.display()))?;
        for ws in &loaded {
            self.ids.observe_workspace(ws.id);
        }
        *workspaces = loaded.into_iter().map(|w| (w.id, w)).collect();
        Ok(workspaces)
    }

    /// Register workspace `id`, or standalone with the next counter value when
    /// `id` is `None`.
    fn insert(
        &self,
        id: Option<i64>,
        task_id: Option<i64>,
        new: NewWorkspace,
    ) -> Result<Workspace> {
        let _dir = DataDirLock::acquire(&self.data_dir)?;
        let mut workspaces = self.current()?;
        let id = match id {
            Some(id) => id,
            None => {
                self.ids.observe_data_dir(&self.data_dir)?;
                self.ids.next_workspace()
            }
        };
        if let Some(existing) = workspaces.get(&id) {
            if existing.task_id == task_id {
                return Ok(existing.clone());
            }
            anyhow::bail!("Workspace {} already exists for a different owner", id);
        }

        let workspace = Workspace {
            id,
            task_id,
            owner: new.owner,
            repo: new.repo,
            path: self.root.join(format!("ws-{}", id)),
            branch: new.branch,
            base_branch: new.base_branch,
            created_at: Utc::now(),
        };
        workspaces.insert(id, workspace.clone());
        if let Err(e) = save_collection(&self.path, workspaces.values()) {
            workspaces.remove(&id);
            return Err(e.into());
        }
        debug!(
            workspace_id = id,
            ?task_id,
            path = %workspace.path.display(),
            "Registered workspace"
        );
        Ok(workspace)
    }
}

#[async_trait]
impl WorkspaceService for WorkspaceStore {
    async fn create_workspace_for_task(&self, task_id: i64, ws: NewWorkspace) -> Result<Workspace> {
        self.insert(Some(task_id), Some(task_id), ws)
    }

    async fn create_workspace(&self, ws: NewWorkspace) -> Result<Workspace> {
        self.insert(None, None, ws)
    }

    async fn get_workspace(&self, id: i64) -> Result<Option<Workspace>> {
        Ok(self.current()?.get(&id).cloned())
    }

    async fn delete_workspace(&self, id: i64) -> Result<()> {
        let removed = {
            let _dir = DataDirLock::acquire(&self.data_dir)?;
            let mut workspaces = self.current()?;
            let removed = workspaces
                .remove(&id)
                .ok_or_else(|| anyhow!("Workspace {} not found", id))?;
            if let Err(e) = save_collection(&self.path, workspaces.values()) {
                workspaces.insert(id, removed);
                return Err(e.into());
            }
            removed
        };

        if removed.path.exists() {
            tokio::fs::remove_dir_all(&removed.path)
                .await
                .with_context(|| format!("Failed to remove {}", removed.path.display()))?;
        }
        info!(workspace_id = id, "Deleted workspace");
        Ok(())
    }
}
