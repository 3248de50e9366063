use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::models::{NewTask, Task, TaskStatus};
use crate::workflow::ids::IdAllocator;
use crate::workflow::persist::{DataDirLock, TASKS_FILE, load_collection, save_collection};

#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, task: NewTask) -> Result<Task>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Set the status. `error` replaces the stored error message when given.
    async fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task>;

    async fn set_task_pr(&self, id: i64, pr_number: i64) -> Result<Task>;
}

/// JSON-file backed task store. IDs come from the shared workflow/task counter.
///
/// An agent runner in another process updates task status in the same file,
/// so every call re-reads it; writes hold the data directory lock.
pub struct TaskStore {
    tasks: Mutex<BTreeMap<i64, Task>>,
    data_dir: PathBuf,
    path: PathBuf,
    ids: Arc<IdAllocator>,
}

impl TaskStore {
    pub fn open(data_dir: &Path, ids: Arc<IdAllocator>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        let store = Self {
            tasks: Mutex::new(BTreeMap::new()),
            data_dir: data_dir.to_path_buf(),
            path: data_dir.join(TASKS_FILE),
            ids,
        };
        drop(store.current()?);
        Ok(store)
    }

    fn load(&self) -> Result<BTreeMap<i64, Task>> {
        let tasks: Vec<Task> = load_collection(&self.path)
            .with_context(|| format!("Failed to load {}", self.path.display()))?;
        for task in &tasks {
            self.ids.observe_shared(task.id);
        }
        Ok(tasks.into_iter().map(|t| (t.id, t)).collect())
    }

    /// The guarded cache, refreshed from disk.
    fn current(&self) -> Result<MutexGuard<'_, BTreeMap<i64, Task>>> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        *tasks = self.load()?;
        Ok(tasks)
    }

    /// Apply `f` to one task and persist, restoring the old value on failure.
    fn modify(&self, id: i64, f: impl FnOnce(&mut Task)) -> Result<Task> {
        let _dir = DataDirLock::acquire(&self.data_dir)?;
        let mut tasks = self.current()?;
        let previous = tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("Task {} not found", id))?;
        let mut updated = previous.clone();
        f(&mut updated);
        updated.updated_at = Utc::now();
        tasks.insert(id, updated.clone());
        if let Err(e) = save_collection(&self.path, tasks.values()) {
            tasks.insert(id, previous);
            return Err(e.into());
        }
        Ok(updated)
    }
}

#[async_trait]
impl TaskService for TaskStore {
    async fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            anyhow::bail!("Task title is required");
        }

        let _dir = DataDirLock::acquire(&self.data_dir)?;
        let mut tasks = self.current()?;
        self.ids.observe_data_dir(&self.data_dir)?;
        let now = Utc::now();
        let task = Task {
            id: self.ids.next_shared(),
            owner: new.owner,
            repo: new.repo,
            issue_number: new.issue_number,
            title: new.title,
            description: new.description,
            status: TaskStatus::Pending,
            branch: None,
            pr_number: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        tasks.insert(task.id, task.clone());
        if let Err(e) = save_collection(&self.path, tasks.values()) {
            tasks.remove(&task.id);
            return Err(e.into());
        }
        debug!(task_id = task.id, issue = task.issue_number, "Created task");
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        Ok(self.current()?.get(&id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.current()?.values().cloned().collect())
    }

    async fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task> {
        self.modify(id, |t| {
            t.status = status;
            if error.is_some() {
                t.error_message = error;
            }
        })
    }

    async fn set_task_pr(&self, id: i64, pr_number: i64) -> Result<Task> {
        self.modify(id, |t| t.pr_number = Some(pr_number))
    }
}
