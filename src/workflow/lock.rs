//! Time-bounded exclusive leases on workflows.
//!
//! The lock table in [`WorkflowStore`] is authoritative; the `locked_*` fields
//! on the workflow are kept in step for display. Every check-and-set runs under
//! the store's write guard and the data directory lock, against the lock table
//! as it is on disk. Leases are advisory: only cowork processes honor them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::{Result, WorkflowError};

use super::models::WorkflowLock;
use super::persist::DataDirLock;
use super::store::{StoreInner, WorkflowStore};

pub struct LockCoordinator {
    store: Arc<WorkflowStore>,
}

impl LockCoordinator {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    /// Take the lease on `workflow_id` for `ttl`. An expired lease held by
    /// anyone is silently replaced.
    pub fn lock(&self, workflow_id: i64, holder_id: &str, ttl: Duration) -> Result<WorkflowLock> {
        self.lock_at(workflow_id, holder_id, ttl, Utc::now())
    }

    pub(crate) fn lock_at(
        &self,
        workflow_id: i64,
        holder_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WorkflowLock> {
        if holder_id.trim().is_empty() {
            return Err(WorkflowError::Validation("holder id is required".into()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| WorkflowError::Validation(format!("lease ttl out of range: {:?}", ttl)))?;

        let mut inner = self.store.write()?;
        let _dir = self.refresh(&mut inner)?;
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(WorkflowError::WorkflowNotFound { id: workflow_id });
        }
        if let Some(existing) = inner.locks.get(&workflow_id)
            && existing.is_valid_at(now)
        {
            return Err(WorkflowError::AlreadyLocked {
                workflow_id,
                holder: existing.holder_id.clone(),
                expires_at: existing.expires_at,
            });
        }

        let lock = WorkflowLock {
            workflow_id,
            holder_id: holder_id.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        let replaced = inner.locks.insert(workflow_id, lock.clone());
        if let Err(e) = self.store.save_locks_locked(&inner) {
            match replaced {
                Some(old) => inner.locks.insert(workflow_id, old),
                None => inner.locks.remove(&workflow_id),
            };
            return Err(e);
        }

        inner.mirror_lease(workflow_id, Some(&lock));
        if let Err(e) = self.store.save_workflows_locked(&inner) {
            // The lock table is authoritative; a stale mirror is harmless.
            warn!(workflow_id, error = %e, "Failed to mirror lease onto workflow");
        }

        if let Some(old) = replaced {
            debug!(workflow_id, previous_holder = %old.holder_id, "Replaced expired lease");
        }
        debug!(workflow_id, holder = %holder_id, expires_at = %lock.expires_at, "Lease acquired");
        Ok(lock)
    }

    /// Release a lease held by `holder_id`.
    pub fn unlock(&self, workflow_id: i64, holder_id: &str) -> Result<()> {
        let mut inner = self.store.write()?;
        let _dir = self.refresh(&mut inner)?;
        let existing = inner
            .locks
            .get(&workflow_id)
            .ok_or(WorkflowError::LockNotFound { workflow_id })?;
        if existing.holder_id != holder_id {
            return Err(WorkflowError::NotLockHolder {
                workflow_id,
                holder: existing.holder_id.clone(),
                requested_by: holder_id.to_string(),
            });
        }

        let removed = inner.locks.remove(&workflow_id);
        if let Err(e) = self.store.save_locks_locked(&inner) {
            if let Some(lock) = removed {
                inner.locks.insert(workflow_id, lock);
            }
            return Err(e);
        }
        self.clear_mirror(&mut inner, workflow_id);
        debug!(workflow_id, holder = %holder_id, "Lease released");
        Ok(())
    }

    /// Remove the lease whoever holds it. Returns whether one existed.
    pub fn force_unlock(&self, workflow_id: i64) -> Result<bool> {
        let mut inner = self.store.write()?;
        let _dir = self.refresh(&mut inner)?;
        let Some(removed) = inner.locks.remove(&workflow_id) else {
            return Ok(false);
        };
        if let Err(e) = self.store.save_locks_locked(&inner) {
            inner.locks.insert(workflow_id, removed);
            return Err(e);
        }
        self.clear_mirror(&mut inner, workflow_id);
        info!(workflow_id, holder = %removed.holder_id, "Lease force-released");
        Ok(true)
    }

    /// The raw lease record, expired or not.
    pub fn get_lock(&self, workflow_id: i64) -> Result<Option<WorkflowLock>> {
        self.store.get_lock_record(workflow_id)
    }

    /// The lease only if it is still valid.
    pub fn active_lock(&self, workflow_id: i64) -> Result<Option<WorkflowLock>> {
        Ok(self.get_lock(workflow_id)?.filter(|l| l.is_valid()))
    }

    pub fn is_locked(&self, workflow_id: i64) -> Result<bool> {
        Ok(self.active_lock(workflow_id)?.is_some())
    }

    /// Remove every expired lease. Persists only if something was removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    pub(crate) fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.store.write()?;
        let _dir = self.refresh(&mut inner)?;
        let expired: Vec<i64> = inner
            .locks
            .values()
            .filter(|l| !l.is_valid_at(now))
            .map(|l| l.workflow_id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let snapshot = inner.locks.clone();
        for id in &expired {
            inner.locks.remove(id);
        }
        if let Err(e) = self.store.save_locks_locked(&inner) {
            inner.locks = snapshot;
            return Err(e);
        }
        for id in &expired {
            inner.mirror_lease(*id, None);
        }
        if let Err(e) = self.store.save_workflows_locked(&inner) {
            warn!(error = %e, "Failed to clear lease fields after sweep");
        }

        info!(count = expired.len(), workflows = ?expired, "Reclaimed expired leases");
        Ok(expired.len())
    }

    /// Take the data directory lock and re-read leases and workflows.
    fn refresh(&self, inner: &mut StoreInner) -> Result<DataDirLock> {
        let dir = self.store.lock_data_dir()?;
        self.store.refresh_locks_locked(inner)?;
        self.store.refresh_workflows_locked(inner)?;
        Ok(dir)
    }

    fn clear_mirror(&self, inner: &mut StoreInner, workflow_id: i64) {
        inner.mirror_lease(workflow_id, None);
        if let Err(e) = self.store.save_workflows_locked(inner) {
            warn!(workflow_id, error = %e, "Failed to clear lease fields on workflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ids::IdAllocator;
    use crate::workflow::models::CreateWorkflowRequest;
    use tempfile::{TempDir, tempdir};

    const TTL: Duration = Duration::from_secs(60);

    fn open_store(path: &std::path::Path) -> Arc<WorkflowStore> {
        Arc::new(WorkflowStore::open(path, Arc::new(IdAllocator::new())).unwrap())
    }

    fn setup() -> (LockCoordinator, i64, TempDir) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let wf = store
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 1))
            .unwrap();
        (LockCoordinator::new(store), wf.id, dir)
    }

    #[test]
    fn test_lock_is_exclusive() {
        let (locks, id, _dir) = setup();
        let lease = locks.lock(id, "a", TTL).unwrap();
        assert_eq!(lease.holder_id, "a");
        assert_eq!(lease.pid, std::process::id());

        let err = locks.lock(id, "b", TTL).unwrap_err();
        match err {
            WorkflowError::AlreadyLocked { holder, expires_at, .. } => {
                assert_eq!(holder, "a");
                assert_eq!(expires_at, lease.expires_at);
            }
            other => panic!("expected AlreadyLocked, got {:?}", other),
        }
        // Same holder is not re-entrant either.
        assert!(locks.lock(id, "a", TTL).unwrap_err().is_lock_conflict());
    }

    #[test]
    fn test_lock_mirrors_onto_workflow() {
        let (locks, id, _dir) = setup();
        let lease = locks.lock(id, "a", TTL).unwrap();
        let wf = locks.store().get_workflow(id).unwrap();
        assert_eq!(wf.locked_by.as_deref(), Some("a"));
        assert_eq!(wf.lock_expires_at, Some(lease.expires_at));

        locks.unlock(id, "a").unwrap();
        let wf = locks.store().get_workflow(id).unwrap();
        assert!(wf.locked_by.is_none());
        assert!(wf.locked_at.is_none());
        assert!(wf.lock_expires_at.is_none());
    }

    #[test]
    fn test_lock_missing_workflow() {
        let (locks, _id, _dir) = setup();
        assert!(matches!(
            locks.lock(404, "a", TTL),
            Err(WorkflowError::WorkflowNotFound { id: 404 })
        ));
    }

    #[test]
    fn test_expired_lease_is_replaced() {
        let (locks, id, _dir) = setup();
        let past = Utc::now() - chrono::Duration::seconds(120);
        locks.lock_at(id, "a", TTL, past).unwrap();
        assert!(!locks.is_locked(id).unwrap());
        assert!(locks.get_lock(id).unwrap().is_some());

        let lease = locks.lock(id, "b", TTL).unwrap();
        assert_eq!(lease.holder_id, "b");
        assert!(locks.is_locked(id).unwrap());
    }

    #[test]
    fn test_unlock_errors() {
        let (locks, id, _dir) = setup();
        assert!(matches!(
            locks.unlock(id, "a"),
            Err(WorkflowError::LockNotFound { .. })
        ));

        locks.lock(id, "a", TTL).unwrap();
        match locks.unlock(id, "b").unwrap_err() {
            WorkflowError::NotLockHolder { holder, requested_by, .. } => {
                assert_eq!(holder, "a");
                assert_eq!(requested_by, "b");
            }
            other => panic!("expected NotLockHolder, got {:?}", other),
        }
        assert!(locks.is_locked(id).unwrap());
    }

    #[test]
    fn test_force_unlock_is_idempotent() {
        let (locks, id, _dir) = setup();
        locks.lock(id, "a", TTL).unwrap();
        assert!(locks.force_unlock(id).unwrap());
        assert!(!locks.force_unlock(id).unwrap());
        assert!(locks.get_lock(id).unwrap().is_none());
        locks.lock(id, "b", TTL).unwrap();
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let a = store
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 1))
            .unwrap();
        let b = store
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 2))
            .unwrap();
        let locks = LockCoordinator::new(store.clone());

        let past = Utc::now() - chrono::Duration::seconds(120);
        locks.lock_at(a.id, "a", TTL, past).unwrap();
        locks.lock(b.id, "b", TTL).unwrap();

        assert_eq!(locks.sweep_expired().unwrap(), 1);
        assert!(locks.get_lock(a.id).unwrap().is_none());
        assert!(locks.get_lock(b.id).unwrap().is_some());
        assert!(store.get_workflow(a.id).unwrap().locked_by.is_none());
        assert_eq!(locks.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn test_sweep_at_expiry_instant() {
        let (locks, id, _dir) = setup();
        let now = Utc::now();
        let lease = locks.lock_at(id, "a", TTL, now).unwrap();
        let just_before = lease.expires_at - chrono::Duration::milliseconds(1);
        assert_eq!(locks.sweep_expired_at(just_before).unwrap(), 0);
        assert_eq!(locks.sweep_expired_at(lease.expires_at).unwrap(), 1);
    }

    #[test]
    fn test_leases_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path());
            let wf = store
                .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 1))
                .unwrap();
            LockCoordinator::new(store).lock(wf.id, "a", TTL).unwrap();
        }
        let locks = LockCoordinator::new(open_store(dir.path()));
        assert!(locks.lock(1, "b", TTL).unwrap_err().is_lock_conflict());
    }

    #[test]
    fn test_lease_held_by_another_store_is_honored() {
        let (a, id, dir) = setup();
        let b = LockCoordinator::new(open_store(dir.path()));

        a.lock(id, "proc-a", TTL).unwrap();
        match b.lock(id, "proc-b", TTL).unwrap_err() {
            WorkflowError::AlreadyLocked { holder, .. } => assert_eq!(holder, "proc-a"),
            other => panic!("expected AlreadyLocked, got {:?}", other),
        }

        a.unlock(id, "proc-a").unwrap();
        b.lock(id, "proc-b", TTL).unwrap();
        assert!(a.lock(id, "proc-a", TTL).unwrap_err().is_lock_conflict());
    }

    #[test]
    fn test_stale_force_unlock_keeps_other_records() {
        let (a, first, dir) = setup();
        let b = LockCoordinator::new(open_store(dir.path()));

        a.lock(first, "proc-a", TTL).unwrap();
        let second = a
            .store()
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 2))
            .unwrap();
        a.lock(second.id, "proc-a", TTL).unwrap();

        assert!(b.force_unlock(first).unwrap());

        let reopened = open_store(dir.path());
        assert_eq!(reopened.list_workflows().unwrap().len(), 2);
        assert!(reopened.get_lock_record(first).unwrap().is_none());
        let kept = reopened.get_lock_record(second.id).unwrap().unwrap();
        assert_eq!(kept.holder_id, "proc-a");
        assert_eq!(
            reopened.get_workflow(second.id).unwrap().locked_by.as_deref(),
            Some("proc-a")
        );
    }

    #[test]
    fn test_concurrent_lockers_across_stores_get_one_winner() {
        let dir = tempdir().unwrap();
        let id = open_store(dir.path())
            .create_workflow(CreateWorkflowRequest::new("acme", "widgets", 1))
            .unwrap()
            .id;
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let locks = LockCoordinator::new(open_store(dir.path()));
                std::thread::spawn(move || locks.lock(id, &format!("proc-{}", n), TTL).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_delete_workflow_drops_lease() {
        let (locks, id, _dir) = setup();
        locks.lock(id, "a", TTL).unwrap();
        locks.store().delete_workflow(id).unwrap();
        assert!(locks.get_lock(id).unwrap().is_none());
    }
}
