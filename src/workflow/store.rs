use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info};

use crate::errors::{Result, WorkflowError};

use super::ids::IdAllocator;
use super::models::*;
use super::persist::{
    DataDirLock, EVENTS_FILE, LOCKS_FILE, WORKFLOWS_FILE, load_collection, save_collection,
};

/// Cached collections. Only reachable through the store's guard.
#[derive(Debug, Default)]
pub(crate) struct StoreInner {
    pub(crate) workflows: BTreeMap<i64, Workflow>,
    pub(crate) events: Vec<WorkflowEvent>,
    pub(crate) locks: BTreeMap<i64, WorkflowLock>,
}

impl StoreInner {
    /// Copy a lease onto the workflow's denormalized lease fields (or clear them).
    pub(crate) fn mirror_lease(&mut self, workflow_id: i64, lock: Option<&WorkflowLock>) {
        if let Some(workflow) = self.workflows.get_mut(&workflow_id) {
            workflow.locked_by = lock.map(|l| l.holder_id.clone());
            workflow.locked_at = lock.map(|l| l.acquired_at);
            workflow.lock_expires_at = lock.map(|l| l.expires_at);
        }
    }
}

/// Durable, cached repository for workflows, events and leases.
///
/// All three collections sit behind one `RwLock`. A mutation takes the write
/// guard, then the data directory lock, re-reads the collections it touches
/// from disk, applies the change and persists before letting go. Other
/// processes sharing the directory therefore never lose records to a stale
/// cache. Reads are served from the cache; [`WorkflowStore::reload`] refreshes it.
pub struct WorkflowStore {
    inner: RwLock<StoreInner>,
    data_dir: PathBuf,
    ids: Arc<IdAllocator>,
}

impl WorkflowStore {
    /// Open (or create) the store under `data_dir` and load whatever is there.
    pub fn open(data_dir: &Path, ids: Arc<IdAllocator>) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|source| WorkflowError::Persistence {
            path: data_dir.to_path_buf(),
            source,
        })?;
        let inner = Self::load_inner(data_dir, &ids)?;
        Ok(Self {
            inner: RwLock::new(inner),
            data_dir: data_dir.to_path_buf(),
            ids,
        })
    }

    fn load_inner(data_dir: &Path, ids: &IdAllocator) -> Result<StoreInner> {
        let inner = StoreInner {
            workflows: load_workflows(data_dir, ids)?,
            events: load_collection(&data_dir.join(EVENTS_FILE))?,
            locks: load_locks(data_dir)?,
        };
        debug!(
            data_dir = %data_dir.display(),
            workflows = inner.workflows.len(),
            events = inner.events.len(),
            locks = inner.locks.len(),
            "Loaded workflow store"
        );
        Ok(inner)
    }

    /// Replace the cache with what is on disk, picking up writes made by
    /// other processes sharing the data directory. On error the cache is kept.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.write()?;
        *inner = Self::load_inner(&self.data_dir, &self.ids)?;
        Ok(())
    }

    /// Exclusive access to the data directory across processes. Take it after
    /// the write guard and hold it through re-read, change and save.
    pub(crate) fn lock_data_dir(&self) -> Result<DataDirLock> {
        DataDirLock::acquire(&self.data_dir)
    }

    pub(crate) fn refresh_workflows_locked(&self, inner: &mut StoreInner) -> Result<()> {
        inner.workflows = load_workflows(&self.data_dir, &self.ids)?;
        Ok(())
    }

    pub(crate) fn refresh_events_locked(&self, inner: &mut StoreInner) -> Result<()> {
        inner.events = load_collection(&self.data_dir.join(EVENTS_FILE))?;
        Ok(())
    }

    pub(crate) fn refresh_locks_locked(&self, inner: &mut StoreInner) -> Result<()> {
        inner.locks = load_locks(&self.data_dir)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, StoreInner>> {
        self.inner.read().map_err(|_| WorkflowError::LockPoisoned)
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>> {
        self.inner.write().map_err(|_| WorkflowError::LockPoisoned)
    }

    // ── Persistence ───────────────────────────────────────────────────

    pub(crate) fn save_workflows_locked(&self, inner: &StoreInner) -> Result<()> {
        save_collection(&self.data_dir.join(WORKFLOWS_FILE), inner.workflows.values())
    }

    pub(crate) fn save_events_locked(&self, inner: &StoreInner) -> Result<()> {
        save_collection(&self.data_dir.join(EVENTS_FILE), &inner.events)
    }

    pub(crate) fn save_locks_locked(&self, inner: &StoreInner) -> Result<()> {
        save_collection(&self.data_dir.join(LOCKS_FILE), inner.locks.values())
    }

    // ── Workflow CRUD ─────────────────────────────────────────────────

    /// Create the workflow for an issue, or return the existing one unchanged.
    pub fn create_workflow(&self, req: CreateWorkflowRequest) -> Result<Workflow> {
        req.validate()?;
        let mut inner = self.write()?;
        let _dir = self.lock_data_dir()?;
        self.refresh_workflows_locked(&mut inner)?;
        self.ids.observe_data_dir(&self.data_dir)?;

        if let Some(existing) = inner
            .workflows
            .values()
            .find(|w| w.matches_issue(&req.owner, &req.repo, req.issue_number))
        {
            debug!(workflow_id = existing.id, issue = %existing.slug(), "Workflow already exists");
            return Ok(existing.clone());
        }

        let id = self.ids.next_shared();
        let now = Utc::now();
        let workflow = Workflow {
            id,
            owner: req.owner,
            repo: req.repo,
            issue_number: req.issue_number,
            base_branch: req.base_branch.unwrap_or_else(|| "main".to_string()),
            state: WorkflowState::Queued,
            branch_name: None,
            pr_number: None,
            task_id: None,
            workspace_id: None,
            provider: req.provider.unwrap_or_else(|| "github".to_string()),
            config: req.config.unwrap_or_default(),
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
            last_event_ts: now,
            started_at: None,
            ended_at: None,
            error_count: 0,
            last_error: None,
            locked_by: None,
            locked_at: None,
            lock_expires_at: None,
        };

        inner.workflows.insert(id, workflow.clone());
        if let Err(e) = self.save_workflows_locked(&inner) {
            inner.workflows.remove(&id);
            return Err(e);
        }

        info!(workflow_id = id, issue = %workflow.slug(), "Created workflow");
        Ok(workflow)
    }

    pub fn get_workflow(&self, id: i64) -> Result<Workflow> {
        self.read()?
            .workflows
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::WorkflowNotFound { id })
    }

    pub fn get_workflow_by_issue(
        &self,
        owner: &str,
        repo: &str,
        issue_number: i64,
    ) -> Result<Option<Workflow>> {
        Ok(self
            .read()?
            .workflows
            .values()
            .find(|w| w.matches_issue(owner, repo, issue_number))
            .cloned())
    }

    pub fn get_workflow_by_pr(
        &self,
        owner: &str,
        repo: &str,
        pr_number: i64,
    ) -> Result<Option<Workflow>> {
        Ok(self
            .read()?
            .workflows
            .values()
            .find(|w| w.owner == owner && w.repo == repo && w.pr_number == Some(pr_number))
            .cloned())
    }

    pub fn list_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self.read()?.workflows.values().cloned().collect())
    }

    pub fn list_workflows_by_state(&self, state: WorkflowState) -> Result<Vec<Workflow>> {
        Ok(self
            .read()?
            .workflows
            .values()
            .filter(|w| w.state == state)
            .cloned()
            .collect())
    }

    /// Apply a partial update. A requested state change must be an edge of the
    /// transition table, checked against the state on disk; otherwise nothing
    /// is written.
    pub fn update_workflow(&self, req: UpdateWorkflowRequest) -> Result<Workflow> {
        req.validate()?;
        let mut inner = self.write()?;
        let _dir = self.lock_data_dir()?;
        self.refresh_workflows_locked(&mut inner)?;

        let previous = inner
            .workflows
            .get(&req.id)
            .cloned()
            .ok_or(WorkflowError::WorkflowNotFound { id: req.id })?;
        let mut updated = previous.clone();
        let now = Utc::now();

        if let Some(to) = req.state {
            if !previous.state.can_transition_to(to) {
                return Err(WorkflowError::InvalidTransition {
                    from: previous.state,
                    to,
                });
            }
            updated.state = to;
            if matches!(to, WorkflowState::WorkspaceReady | WorkflowState::Implementing)
                && updated.started_at.is_none()
            {
                updated.started_at = Some(now);
            }
            if to.is_terminal() && updated.ended_at.is_none() {
                updated.ended_at = Some(now);
            }
        }
        if let Some(branch) = req.branch_name {
            updated.branch_name = Some(branch);
        }
        if let Some(pr) = req.pr_number {
            updated.pr_number = Some(pr);
        }
        if let Some(task_id) = req.task_id {
            updated.task_id = Some(task_id);
        }
        if let Some(workspace_id) = req.workspace_id {
            updated.workspace_id = Some(workspace_id);
        }
        if let Some(config) = req.config {
            updated.config = config;
        }
        if let Some(metadata) = req.metadata {
            updated.metadata.extend(metadata);
        }
        if let Some(count) = req.error_count {
            updated.error_count = count;
        }
        if let Some(err) = req.last_error {
            updated.last_error = Some(err);
        }
        updated.updated_at = now;
        match req.event_cursor {
            EventCursor::Now => updated.last_event_ts = now,
            EventCursor::Keep => {}
            EventCursor::At(ts) => updated.last_event_ts = ts,
        }

        inner.workflows.insert(req.id, updated.clone());
        if let Err(e) = self.save_workflows_locked(&inner) {
            inner.workflows.insert(req.id, previous);
            return Err(e);
        }

        if previous.state != updated.state {
            info!(
                workflow_id = req.id,
                from = %previous.state,
                to = %updated.state,
                "Workflow transitioned"
            );
        }
        Ok(updated)
    }

    /// Remove a workflow and any lease record it still has.
    pub fn delete_workflow(&self, id: i64) -> Result<()> {
        let mut inner = self.write()?;
        let _dir = self.lock_data_dir()?;
        self.refresh_workflows_locked(&mut inner)?;
        self.refresh_locks_locked(&mut inner)?;
        let workflow = inner
            .workflows
            .remove(&id)
            .ok_or(WorkflowError::WorkflowNotFound { id })?;
        if let Err(e) = self.save_workflows_locked(&inner) {
            inner.workflows.insert(id, workflow);
            return Err(e);
        }
        if inner.locks.remove(&id).is_some() {
            self.save_locks_locked(&inner)?;
        }
        info!(workflow_id = id, issue = %workflow.slug(), "Deleted workflow");
        Ok(())
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn create_event(&self, new: NewWorkflowEvent) -> Result<WorkflowEvent> {
        new.validate()?;
        let event = WorkflowEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: new.event_type,
            provider: if new.provider.is_empty() {
                "github".to_string()
            } else {
                new.provider
            },
            timestamp: Utc::now(),
            owner: new.owner,
            repo: new.repo,
            issue_number: new.issue_number,
            payload: new.payload,
            processed: false,
            job_id: None,
            error: None,
        };

        let mut inner = self.write()?;
        let _dir = self.lock_data_dir()?;
        self.refresh_events_locked(&mut inner)?;
        inner.events.push(event.clone());
        if let Err(e) = self.save_events_locked(&inner) {
            inner.events.pop();
            return Err(e);
        }
        debug!(event_id = %event.id, event_type = %event.event_type, "Recorded event");
        Ok(event)
    }

    pub fn get_event(&self, id: &str) -> Result<WorkflowEvent> {
        self.read()?
            .events
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| WorkflowError::EventNotFound { id: id.to_string() })
    }

    pub fn list_events(&self) -> Result<Vec<WorkflowEvent>> {
        Ok(self.read()?.events.clone())
    }

    /// Unprocessed events, oldest first.
    pub fn list_unprocessed_events(&self) -> Result<Vec<WorkflowEvent>> {
        let mut pending: Vec<WorkflowEvent> = self
            .read()?
            .events
            .iter()
            .filter(|e| !e.processed)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.timestamp);
        Ok(pending)
    }

    pub fn mark_event_processed(
        &self,
        event_id: &str,
        workflow_id: Option<i64>,
        error: Option<String>,
    ) -> Result<WorkflowEvent> {
        let mut inner = self.write()?;
        let _dir = self.lock_data_dir()?;
        self.refresh_events_locked(&mut inner)?;
        let idx = inner
            .events
            .iter()
            .position(|e| e.id == event_id)
            .ok_or_else(|| WorkflowError::EventNotFound {
                id: event_id.to_string(),
            })?;

        let previous = inner.events[idx].clone();
        {
            let event = &mut inner.events[idx];
            event.processed = true;
            if workflow_id.is_some() {
                event.job_id = workflow_id;
            }
            event.error = error;
        }
        if let Err(e) = self.save_events_locked(&inner) {
            inner.events[idx] = previous;
            return Err(e);
        }
        Ok(inner.events[idx].clone())
    }

    // ── Lease records (read side) ─────────────────────────────────────

    pub fn get_lock_record(&self, workflow_id: i64) -> Result<Option<WorkflowLock>> {
        Ok(self.read()?.locks.get(&workflow_id).cloned())
    }

    pub fn list_lock_records(&self) -> Result<Vec<WorkflowLock>> {
        Ok(self.read()?.locks.values().cloned().collect())
    }
}

fn load_workflows(data_dir: &Path, ids: &IdAllocator) -> Result<BTreeMap<i64, Workflow>> {
    let workflows: Vec<Workflow> = load_collection(&data_dir.join(WORKFLOWS_FILE))?;
    for workflow in &workflows {
        ids.observe_shared(workflow.id);
    }
    Ok(workflows.into_iter().map(|w| (w.id, w)).collect())
}

fn load_locks(data_dir: &Path) -> Result<BTreeMap<i64, WorkflowLock>> {
    let locks: Vec<WorkflowLock> = load_collection(&data_dir.join(LOCKS_FILE))?;
    Ok(locks.into_iter().map(|l| (l.workflow_id, l)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn open_store() -> (WorkflowStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();
        (store, dir)
    }

    fn create(store: &WorkflowStore, issue: i64) -> Workflow {
        store
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", issue))
            .unwrap()
    }

    #[test]
    fn test_create_sets_defaults() {
        let (store, _dir) = open_store();
        let wf = create(&store, 7);
        assert_eq!(wf.id, 1);
        assert_eq!(wf.state, WorkflowState::Queued);
        assert_eq!(wf.base_branch, "main");
        assert_eq!(wf.provider, "github");
        assert!(wf.task_id.is_none());
        assert!(wf.started_at.is_none());
        assert_eq!(wf.created_at, wf.updated_at);
    }

    #[test]
    fn test_create_is_idempotent_per_issue() {
        let (store, _dir) = open_store();
        let first = create(&store, 7);
        let second = create(&store, 7);
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_workflows().unwrap().len(), 1);

        let other_repo = store
            .create_workflow(CreateWorkflowRequest::new("acme", "gadgets", 7))
            .unwrap();
        assert_ne!(other_repo.id, first.id);
    }

    #[test]
    fn test_create_rejects_invalid_request() {
        let (store, _dir) = open_store();
        let err = store
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 0))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(store.list_workflows().unwrap().is_empty());
    }

    #[test]
    fn test_create_fails_cleanly_when_data_dir_is_gone() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let store = WorkflowStore::open(&data, Arc::new(IdAllocator::new())).unwrap();
        std::fs::remove_dir_all(&data).unwrap();

        let err = store
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 1))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Persistence { .. }));
        assert!(store.list_workflows().unwrap().is_empty());

        std::fs::create_dir_all(&data).unwrap();
        let wf = create(&store, 1);
        assert_eq!(wf.id, 1);
    }

    #[test]
    fn test_get_missing_workflow_is_not_found() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.get_workflow(99),
            Err(WorkflowError::WorkflowNotFound { id: 99 })
        ));
    }

    #[test]
    fn test_lookup_by_issue_and_state() {
        let (store, _dir) = open_store();
        let a = create(&store, 1);
        let b = create(&store, 2);
        store
            .update_workflow(UpdateWorkflowRequest::new(b.id).state(WorkflowState::WorkspaceReady))
            .unwrap();

        assert_eq!(
            store.get_workflow_by_issue("acme", "widgets", 1).unwrap().unwrap().id,
            a.id
        );
        assert!(store.get_workflow_by_issue("acme", "widgets", 3).unwrap().is_none());

        let queued = store.list_workflows_by_state(WorkflowState::Queued).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);
    }

    #[test]
    fn test_update_applies_only_present_fields() {
        let (store, _dir) = open_store();
        let wf = create(&store, 1);
        store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).task_id(5).metadata("k", "v"))
            .unwrap();
        let updated = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).branch_name("cowork/issue-1-x"))
            .unwrap();

        assert_eq!(updated.task_id, Some(5));
        assert_eq!(updated.branch_name.as_deref(), Some("cowork/issue-1-x"));
        assert_eq!(updated.metadata["k"], "v");
        assert_eq!(updated.state, WorkflowState::Queued);
        assert!(updated.updated_at >= wf.updated_at);
        assert!(updated.last_event_ts >= wf.last_event_ts);
    }

    #[test]
    fn test_invalid_transitions_leave_state_unchanged() {
        let (store, _dir) = open_store();
        let wf = create(&store, 1);
        for to in WorkflowState::ALL {
            if WorkflowState::Queued.can_transition_to(to) {
                continue;
            }
            let err = store
                .update_workflow(UpdateWorkflowRequest::new(wf.id).state(to).task_id(9))
                .unwrap_err();
            assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
            let stored = store.get_workflow(wf.id).unwrap();
            assert_eq!(stored.state, WorkflowState::Queued);
            assert!(stored.task_id.is_none(), "rejected update must not apply other fields");
        }
    }

    #[test]
    fn test_started_and_ended_timestamps() {
        let (store, _dir) = open_store();
        let wf = create(&store, 1);
        let ready = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::WorkspaceReady))
            .unwrap();
        let started = ready.started_at.expect("started_at set on workspace_ready");

        let implementing = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Implementing))
            .unwrap();
        assert_eq!(implementing.started_at, Some(started));
        assert!(implementing.ended_at.is_none());

        let aborted = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Aborted))
            .unwrap();
        assert!(aborted.ended_at.is_some());

        let err = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Queued))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();
            let wf = create(&store, 1);
            let req = UpdateWorkflowRequest::new(wf.id).state(WorkflowState::WorkspaceReady);
            store.update_workflow(req).unwrap();
            create(&store, 2);
        }

        let ids = Arc::new(IdAllocator::new());
        let store = WorkflowStore::open(dir.path(), ids.clone()).unwrap();
        let workflows = store.list_workflows().unwrap();
        assert_eq!(workflows.len(), 2);
        assert_eq!(workflows[0].state, WorkflowState::WorkspaceReady);
        // New IDs continue after the highest persisted one.
        assert_eq!(ids.peek_shared(), 3);
    }

    #[test]
    fn test_delete_workflow() {
        let (store, _dir) = open_store();
        let wf = create(&store, 1);
        store.delete_workflow(wf.id).unwrap();
        assert!(store.list_workflows().unwrap().is_empty());
        assert!(matches!(
            store.delete_workflow(wf.id),
            Err(WorkflowError::WorkflowNotFound { .. })
        ));
    }

    #[test]
    fn test_event_lifecycle() {
        let (store, _dir) = open_store();
        let event = store
            .create_event(NewWorkflowEvent {
                event_type: "issue_comment".into(),
                provider: String::new(),
                owner: "acme".into(),
                repo: "widgets".into(),
                issue_number: 4,
                payload: serde_json::Map::new(),
            })
            .unwrap();
        assert_eq!(event.provider, "github");
        assert!(!event.processed);
        assert_eq!(store.list_unprocessed_events().unwrap().len(), 1);

        let marked = store
            .mark_event_processed(&event.id, Some(3), Some("boom".into()))
            .unwrap();
        assert!(marked.processed);
        assert_eq!(marked.job_id, Some(3));
        assert_eq!(marked.error.as_deref(), Some("boom"));
        assert!(store.list_unprocessed_events().unwrap().is_empty());
        // Still kept for audit.
        assert_eq!(store.list_events().unwrap().len(), 1);
        assert!(store.get_event(&event.id).unwrap().processed);
    }

    #[test]
    fn test_missing_event_is_not_found() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.get_event("nope"),
            Err(WorkflowError::EventNotFound { .. })
        ));
        assert!(matches!(
            store.mark_event_processed("nope", None, None),
            Err(WorkflowError::EventNotFound { .. })
        ));
    }

    #[test]
    fn test_collections_written_as_json_arrays() {
        let (store, dir) = open_store();
        create(&store, 1);
        let raw = std::fs::read_to_string(dir.path().join(WORKFLOWS_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[0]["state"], "queued");
        assert_eq!(parsed[0]["issue_number"], 1);
    }

    #[test]
    fn test_reload_picks_up_other_process_writes() {
        let (store, dir) = open_store();
        create(&store, 1);

        let other = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();
        let created = create(&other, 2);
        assert!(store.get_workflow(created.id).is_err());

        store.reload().unwrap();
        assert_eq!(store.list_workflows().unwrap().len(), 2);
        assert_eq!(store.get_workflow(created.id).unwrap().issue_number, 2);
        assert!(store.ids().peek_shared() > created.id);
    }

    #[test]
    fn test_stale_store_writes_keep_other_process_records() {
        let (a, dir) = open_store();
        let first = create(&a, 1);
        let b = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();

        // Written after `b` loaded its cache.
        let second = create(&a, 2);
        let third = create(&b, 3);
        assert_ne!(third.id, second.id);
        b.update_workflow(UpdateWorkflowRequest::new(first.id).task_id(4)).unwrap();

        let reopened = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();
        let ids: Vec<i64> = reopened.list_workflows().unwrap().iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert_eq!(reopened.get_workflow(first.id).unwrap().task_id, Some(4));
    }

    #[test]
    fn test_transition_is_checked_against_disk_state() {
        let (a, dir) = open_store();
        let wf = create(&a, 1);
        let b = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();

        a.update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Aborted))
            .unwrap();
        // `b` still caches `queued`, but the workflow is terminal on disk.
        let err = b
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::WorkspaceReady))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_event_cursor_modes() {
        let (store, _dir) = open_store();
        let wf = create(&store, 1);

        let kept = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).error(1, "boom").keep_event_cursor())
            .unwrap();
        assert_eq!(kept.last_event_ts, wf.last_event_ts);
        assert!(kept.updated_at >= wf.updated_at);

        let at = wf.created_at - chrono::Duration::minutes(5);
        let moved = store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).event_cursor_at(at))
            .unwrap();
        assert_eq!(moved.last_event_ts, at);

        let bumped = store.update_workflow(UpdateWorkflowRequest::new(wf.id)).unwrap();
        assert!(bumped.last_event_ts > at);
    }

    #[test]
    fn test_events_from_two_stores_are_all_kept() {
        let (a, dir) = open_store();
        let b = WorkflowStore::open(dir.path(), Arc::new(IdAllocator::new())).unwrap();
        let new_event = |issue| NewWorkflowEvent {
            event_type: "issues".into(),
            provider: String::new(),
            owner: "acme".into(),
            repo: "widgets".into(),
            issue_number: issue,
            payload: serde_json::Map::new(),
        };
        let first = a.create_event(new_event(1)).unwrap();
        b.create_event(new_event(2)).unwrap();
        b.mark_event_processed(&first.id, None, None).unwrap();

        a.reload().unwrap();
        let events = a.list_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(a.get_event(&first.id).unwrap().processed);
    }
}
