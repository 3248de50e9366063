//! Advances one workflow a single step under its lease.
//!
//! Each call to [`Engine::process_workflow`] takes the lease, runs the handler
//! for the workflow's current state, commits at most one transition and lets
//! the lease go. Callers drive progress by calling it again later.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cowork::facade::CoworkProvider;
use crate::cowork::git::GitOps;
use crate::cowork::models::{PrState, Task, TaskStatus, Workspace};
use crate::cowork::provider::IssueProvider;
use crate::cowork::tasks::TaskService;
use crate::cowork::workspaces::WorkspaceService;
use crate::errors::{Result, WorkflowError};

use super::events::EventQueue;
use super::feedback::classify_feedback;
use super::lock::LockCoordinator;
use super::models::*;
use super::store::WorkflowStore;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// Metadata key holding the most recent review-feedback classification.
pub const FEEDBACK_INTENT_KEY: &str = "last_feedback_intent";

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn IssueProvider>,
    pub tasks: Arc<dyn TaskService>,
    pub workspaces: Arc<dyn WorkspaceService>,
    pub git: Arc<dyn GitOps>,
    pub cowork: Arc<dyn CoworkProvider>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Identifies this process in lease records.
    pub holder_id: String,
    pub lease_ttl: Duration,
    /// Applied to workflows the engine creates itself.
    pub base_branch: String,
    pub workflow_config: WorkflowConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            holder_id: format!("cowork-{}", std::process::id()),
            lease_ttl: DEFAULT_LEASE_TTL,
            base_branch: "main".to_string(),
            workflow_config: WorkflowConfig::default(),
        }
    }
}

/// Releases the lease when dropped, on every exit path.
struct LeaseGuard<'a> {
    locks: &'a LockCoordinator,
    workflow_id: i64,
    holder_id: &'a str,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locks.unlock(self.workflow_id, self.holder_id) {
            warn!(workflow_id = self.workflow_id, error = %e, "Failed to release lease");
        }
    }
}

pub struct Engine {
    store: Arc<WorkflowStore>,
    locks: Arc<LockCoordinator>,
    collab: Collaborators,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Arc<WorkflowStore>,
        locks: Arc<LockCoordinator>,
        collab: Collaborators,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            locks,
            collab,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn holder_id(&self) -> &str {
        &self.settings.holder_id
    }

    fn acquire(&self, workflow_id: i64) -> Result<LeaseGuard<'_>> {
        self.locks
            .lock(workflow_id, &self.settings.holder_id, self.settings.lease_ttl)?;
        Ok(LeaseGuard {
            locks: &self.locks,
            workflow_id,
            holder_id: &self.settings.holder_id,
        })
    }

    /// Create (or find) the workflow for an issue with the engine's defaults.
    pub fn create_workflow_for_issue(
        &self,
        owner: &str,
        repo: &str,
        issue_number: i64,
    ) -> Result<Workflow> {
        let mut req = CreateWorkflowRequest::new(owner, repo, issue_number)
            .with_base_branch(&self.settings.base_branch)
            .with_config(self.settings.workflow_config.clone());
        req.provider = Some(self.collab.provider.name().to_string());
        self.store.create_workflow(req)
    }

    /// Advance workflow `id` by at most one transition.
    #[instrument(skip(self), fields(holder = %self.settings.holder_id))]
    pub async fn process_workflow(&self, id: i64) -> Result<Workflow> {
        let workflow = self.store.get_workflow(id)?;
        if workflow.is_terminal() {
            return Err(WorkflowError::TerminalState {
                id,
                state: workflow.state,
            });
        }

        let lease = self.acquire(id)?;

        // Someone may have moved it between the first read and the lease.
        let workflow = self.store.get_workflow(id)?;
        if workflow.is_terminal() {
            return Err(WorkflowError::TerminalState {
                id,
                state: workflow.state,
            });
        }

        debug!(workflow_id = id, state = %workflow.state, "Processing workflow");
        if let Err(e) = self.step(&workflow).await {
            self.record_failure(id, &e);
            return Err(e);
        }
        drop(lease);

        // Re-read so the returned lease fields reflect the release.
        self.store.get_workflow(id)
    }

    async fn step(&self, wf: &Workflow) -> Result<Workflow> {
        match wf.state {
            WorkflowState::Queued => self.handle_queued(wf).await,
            WorkflowState::WorkspaceReady => self.handle_workspace_ready(wf).await,
            WorkflowState::Implementing => self.handle_implementing(wf).await,
            WorkflowState::PrOpen => self.handle_pr_open(wf).await,
            WorkflowState::Revising => self.handle_revising(wf).await,
            WorkflowState::Merged | WorkflowState::Closed | WorkflowState::Aborted => {
                Err(WorkflowError::TerminalState {
                    id: wf.id,
                    state: wf.state,
                })
            }
        }
    }

    /// Best-effort failure bookkeeping while the lease is still held. The
    /// feedback cursor stays put so nothing fetched after it is skipped.
    fn record_failure(&self, id: i64, err: &WorkflowError) {
        let count = match self.store.get_workflow(id) {
            Ok(wf) => wf.error_count.saturating_add(1),
            Err(e) => {
                warn!(workflow_id = id, error = %e, "Failed to record workflow failure");
                return;
            }
        };
        let message = err.to_string();
        warn!(workflow_id = id, error_count = count, error = %message, "Workflow step failed");
        let req = UpdateWorkflowRequest::new(id)
            .error(count, &message)
            .keep_event_cursor();
        if let Err(e) = self.store.update_workflow(req) {
            warn!(workflow_id = id, error = %e, "Failed to record workflow failure");
        }
    }

    // ── State handlers ────────────────────────────────────────────────

    async fn handle_queued(&self, wf: &Workflow) -> Result<Workflow> {
        let issue = self
            .collab
            .provider
            .get_issue(&wf.owner, &wf.repo, wf.issue_number)
            .await
            .map_err(WorkflowError::collaborator("fetch issue"))?;

        let existing_task = match wf.task_id {
            Some(task_id) => self
                .collab
                .tasks
                .get_task(task_id)
                .await
                .map_err(WorkflowError::collaborator("load task"))?,
            None => None,
        };
        let task = match existing_task {
            Some(task) => task,
            None => {
                let task = self
                    .collab
                    .cowork
                    .create_task_from_issue(&wf.owner, &wf.repo, &issue)
                    .await
                    .map_err(WorkflowError::collaborator("create task"))?;
                // Record right away so a later failure doesn't orphan the task.
                self.store
                    .update_workflow(UpdateWorkflowRequest::new(wf.id).task_id(task.id))?;
                task
            }
        };

        let existing_ws = match wf.workspace_id {
            Some(ws_id) => self
                .collab
                .workspaces
                .get_workspace(ws_id)
                .await
                .map_err(WorkflowError::collaborator("load workspace"))?,
            None => None,
        };
        let workspace = match existing_ws {
            Some(ws) => ws,
            None => {
                let branch = wf
                    .branch_name
                    .clone()
                    .unwrap_or_else(|| self.collab.provider.branch_name_for_issue(&issue));
                self.collab
                    .cowork
                    .create_workspace_for_task(&task, &wf.base_branch, &branch)
                    .await
                    .map_err(WorkflowError::collaborator("create workspace"))?
            }
        };

        self.store.update_workflow(
            UpdateWorkflowRequest::new(wf.id)
                .state(WorkflowState::WorkspaceReady)
                .task_id(task.id)
                .workspace_id(workspace.id)
                .branch_name(&workspace.branch),
        )
    }

    async fn handle_workspace_ready(&self, wf: &Workflow) -> Result<Workflow> {
        let task = self.require_task(wf).await?;
        if task.status != TaskStatus::InProgress {
            self.collab
                .tasks
                .update_task_status(task.id, TaskStatus::InProgress, None)
                .await
                .map_err(WorkflowError::collaborator("start task"))?;
        }
        self.store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Implementing))
    }

    async fn handle_implementing(&self, wf: &Workflow) -> Result<Workflow> {
        let task = self.require_task(wf).await?;
        match task.status {
            TaskStatus::Completed => {
                let workspace = self.require_workspace(wf).await?;
                let pr = self
                    .collab
                    .cowork
                    .create_pull_request_for_task(&task, &workspace, wf.config.draft_pr)
                    .await
                    .map_err(WorkflowError::collaborator("open pull request"))?;
                info!(workflow_id = wf.id, pr_number = pr.number, "Pull request opened");
                self.store.update_workflow(
                    UpdateWorkflowRequest::new(wf.id)
                        .state(WorkflowState::PrOpen)
                        .pr_number(pr.number),
                )
            }
            TaskStatus::Failed => {
                let reason = task
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("task {} failed", task.id));
                warn!(
                    workflow_id = wf.id,
                    task_id = task.id,
                    reason = %reason,
                    "Task failed; aborting workflow"
                );
                self.store.update_workflow(
                    UpdateWorkflowRequest::new(wf.id)
                        .state(WorkflowState::Aborted)
                        .last_error(&reason),
                )
            }
            TaskStatus::Pending | TaskStatus::InProgress => Ok(wf.clone()),
        }
    }

    async fn handle_pr_open(&self, wf: &Workflow) -> Result<Workflow> {
        let pr_number = wf.pr_number.ok_or_else(|| {
            WorkflowError::Validation(format!(
                "workflow {} is pr_open without a pull request number",
                wf.id
            ))
        })?;
        let pr = self
            .collab
            .provider
            .get_pull_request(&wf.owner, &wf.repo, pr_number)
            .await
            .map_err(WorkflowError::collaborator("fetch pull request"))?;

        if pr.state == PrState::Closed {
            if pr.merged {
                self.cleanup_after_merge(wf).await?;
                info!(workflow_id = wf.id, pr_number, "Pull request merged");
                let req = UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Merged);
                return self.store.update_workflow(req);
            }
            info!(workflow_id = wf.id, pr_number, "Pull request closed without merge");
            let req = UpdateWorkflowRequest::new(wf.id).state(WorkflowState::Closed);
            return self.store.update_workflow(req);
        }

        let updates = self
            .collab
            .provider
            .fetch_updates(&wf.owner, &wf.repo, pr_number, wf.last_event_ts)
            .await
            .map_err(WorkflowError::collaborator("fetch pull request updates"))?;
        if updates.is_empty() {
            return Ok(wf.clone());
        }

        let intent = classify_feedback(&updates.reviews, &updates.comments);
        let mut req =
            UpdateWorkflowRequest::new(wf.id).metadata(FEEDBACK_INTENT_KEY, intent.as_str());
        // Resume after the newest item seen, not after the fetch.
        if let Some(latest) = updates.latest_activity() {
            req = req.event_cursor_at(latest);
        }
        if intent.requires_revision() {
            info!(workflow_id = wf.id, intent = %intent, "Review feedback requests changes");
            return self.store.update_workflow(req.state(WorkflowState::Revising));
        }
        info!(
            workflow_id = wf.id,
            comments = updates.comments.len(),
            "Review feedback is a question; no revision needed"
        );
        self.store.update_workflow(req)
    }

    async fn handle_revising(&self, wf: &Workflow) -> Result<Workflow> {
        let workspace = self.require_workspace(wf).await?;
        let git = &self.collab.git;
        match wf.config.sync_strategy {
            SyncStrategy::Rebase => {
                if let Err(e) = git.rebase_onto(&workspace.path, &wf.base_branch).await {
                    warn!(
                        workflow_id = wf.id,
                        error = %format!("{:#}", e),
                        "Rebase failed, falling back to merge"
                    );
                    git.merge_from(&workspace.path, &wf.base_branch)
                        .await
                        .map_err(WorkflowError::collaborator("sync with base branch"))?;
                }
            }
            SyncStrategy::Merge => {
                git.merge_from(&workspace.path, &wf.base_branch)
                    .await
                    .map_err(WorkflowError::collaborator("sync with base branch"))?;
            }
        }

        if let Some(task_id) = wf.task_id {
            self.collab
                .tasks
                .update_task_status(task_id, TaskStatus::InProgress, None)
                .await
                .map_err(WorkflowError::collaborator("resume task"))?;
        }
        self.store
            .update_workflow(UpdateWorkflowRequest::new(wf.id).state(WorkflowState::PrOpen))
    }

    /// Workspace deletion must succeed; remote branch deletion is best-effort.
    async fn cleanup_after_merge(&self, wf: &Workflow) -> Result<()> {
        if let Some(ws_id) = wf.workspace_id {
            let exists = self
                .collab
                .workspaces
                .get_workspace(ws_id)
                .await
                .map_err(WorkflowError::collaborator("load workspace"))?
                .is_some();
            if exists {
                self.collab
                    .workspaces
                    .delete_workspace(ws_id)
                    .await
                    .map_err(WorkflowError::collaborator("delete workspace"))?;
            }
        }
        if let Some(branch) = &wf.branch_name
            && let Err(e) = self
                .collab
                .provider
                .delete_branch(&wf.owner, &wf.repo, branch)
                .await
        {
            warn!(
                workflow_id = wf.id,
                branch = %branch,
                error = %e,
                "Failed to delete remote branch"
            );
        }
        Ok(())
    }

    async fn require_task(&self, wf: &Workflow) -> Result<Task> {
        let task_id = wf.task_id.ok_or_else(|| {
            WorkflowError::Validation(format!("workflow {} has no task", wf.id))
        })?;
        self.collab
            .tasks
            .get_task(task_id)
            .await
            .map_err(WorkflowError::collaborator("load task"))?
            .ok_or_else(|| {
                let missing = anyhow::anyhow!("task {} not found", task_id);
                WorkflowError::collaborator("load task")(missing)
            })
    }

    async fn require_workspace(&self, wf: &Workflow) -> Result<Workspace> {
        let ws_id = wf.workspace_id.ok_or_else(|| {
            WorkflowError::Validation(format!("workflow {} has no workspace", wf.id))
        })?;
        self.collab
            .workspaces
            .get_workspace(ws_id)
            .await
            .map_err(WorkflowError::collaborator("load workspace"))?
            .ok_or_else(|| {
                WorkflowError::collaborator("load workspace")(anyhow::anyhow!(
                    "workspace {} not found",
                    ws_id
                ))
            })
    }

    // ── Administrative and batch operations ───────────────────────────

    /// Abort a non-terminal workflow under its lease.
    pub async fn abort_workflow(&self, id: i64, reason: &str) -> Result<Workflow> {
        let workflow = self.store.get_workflow(id)?;
        if workflow.is_terminal() {
            return Err(WorkflowError::TerminalState {
                id,
                state: workflow.state,
            });
        }
        let _lease = self.acquire(id)?;
        let aborted = self.store.update_workflow(
            UpdateWorkflowRequest::new(id)
                .state(WorkflowState::Aborted)
                .last_error(reason)
                .metadata("abort_reason", reason),
        )?;
        info!(workflow_id = id, reason, "Workflow aborted");
        Ok(aborted)
    }

    /// Process every pending event, oldest first. Returns how many were
    /// marked processed; events whose workflow is leased elsewhere stay pending.
    pub async fn process_pending_events(&self, queue: &EventQueue) -> Result<usize> {
        let mut processed = 0;
        for event in queue.pending()? {
            let Some(workflow) = self.resolve_event_workflow(&event)? else {
                let reason = format!(
                    "no workflow for {}/{}#{}",
                    event.owner, event.repo, event.issue_number
                );
                debug!(event_id = %event.id, reason = %reason, "Skipping event");
                queue.mark_processed(&event.id, None, Some(reason))?;
                processed += 1;
                continue;
            };

            let error = match self.process_workflow(workflow.id).await {
                Ok(_) | Err(WorkflowError::TerminalState { .. }) => None,
                Err(e) if e.is_lock_conflict() => {
                    debug!(
                        event_id = %event.id,
                        workflow_id = workflow.id,
                        "Workflow leased elsewhere; event left pending"
                    );
                    continue;
                }
                Err(e) => Some(e.to_string()),
            };
            queue.mark_processed(&event.id, Some(workflow.id), error)?;
            processed += 1;
        }
        Ok(processed)
    }

    fn resolve_event_workflow(&self, event: &WorkflowEvent) -> Result<Option<Workflow>> {
        if let Some(wf) =
            self.store
                .get_workflow_by_issue(&event.owner, &event.repo, event.issue_number)?
        {
            return Ok(Some(wf));
        }
        let opens_issue = event.event_type == "issues"
            && matches!(event.action(), Some("opened") | Some("reopened"));
        if !opens_issue {
            return Ok(None);
        }
        self.create_workflow_for_issue(&event.owner, &event.repo, event.issue_number)
            .map(Some)
    }

    /// One pass over every non-terminal workflow. Returns how many changed
    /// state; failures are logged and left for the next pass.
    pub async fn process_active(&self) -> Result<usize> {
        let mut advanced = 0;
        for wf in self.store.list_workflows()? {
            if wf.is_terminal() {
                continue;
            }
            match self.process_workflow(wf.id).await {
                Ok(updated) if updated.state != wf.state => advanced += 1,
                Ok(_) => {}
                Err(e) if e.is_lock_conflict() => {
                    debug!(workflow_id = wf.id, "Workflow leased elsewhere");
                }
                Err(e) => warn!(workflow_id = wf.id, error = %e, "Workflow processing failed"),
            }
        }
        Ok(advanced)
    }

    /// Create workflows for every open issue in a repository.
    pub async fn scan_repository(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>> {
        let issues = self
            .collab
            .cowork
            .scan_open_issues(owner, repo)
            .await
            .map_err(WorkflowError::collaborator("scan open issues"))?;
        let mut workflows = Vec::with_capacity(issues.len());
        for issue in issues {
            workflows.push(self.create_workflow_for_issue(owner, repo, issue.number)?);
        }
        info!(owner, repo, count = workflows.len(), "Scanned repository");
        Ok(workflows)
    }
}
