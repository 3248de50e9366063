use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, WorkflowError};

use super::state_machine;

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Queued,
    WorkspaceReady,
    Implementing,
    PrOpen,
    Revising,
    Merged,
    Closed,
    Aborted,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 8] = [
        Self::Queued,
        Self::WorkspaceReady,
        Self::Implementing,
        Self::PrOpen,
        Self::Revising,
        Self::Merged,
        Self::Closed,
        Self::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::WorkspaceReady => "workspace_ready",
            Self::Implementing => "implementing",
            Self::PrOpen => "pr_open",
            Self::Revising => "revising",
            Self::Merged => "merged",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        state_machine::is_terminal(*self)
    }

    pub fn can_transition_to(&self, to: WorkflowState) -> bool {
        state_machine::can_transition_to(*self, to)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "workspace_ready" => Ok(Self::WorkspaceReady),
            "implementing" => Ok(Self::Implementing),
            "pr_open" => Ok(Self::PrOpen),
            "revising" => Ok(Self::Revising),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Invalid workflow state: {}", s)),
        }
    }
}

/// How the feature branch catches up with the base branch while revising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Rebase onto the base branch, falling back to a merge if the rebase fails.
    #[default]
    Rebase,
    /// Merge the base branch in; never rebase.
    Merge,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rebase => "rebase",
            Self::Merge => "merge",
        }
    }
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rebase" => Ok(Self::Rebase),
            "merge" => Ok(Self::Merge),
            _ => Err(WorkflowError::Validation(format!(
                "Invalid sync strategy '{}'. Valid values: rebase, merge",
                s
            ))),
        }
    }
}

/// Per-workflow knobs: sync strategy, retry/timeout settings and safety flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i32,
    /// Open pull requests as drafts.
    #[serde(default)]
    pub draft_pr: bool,
    /// Let the provider merge the pull request once approved.
    #[serde(default)]
    pub auto_merge: bool,
}

fn default_max_retries() -> i32 {
    3
}

fn default_timeout_minutes() -> i32 {
    60
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            sync_strategy: SyncStrategy::default(),
            max_retries: default_max_retries(),
            timeout_minutes: default_timeout_minutes(),
            draft_pr: false,
            auto_merge: false,
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 0 {
            return Err(WorkflowError::Validation(format!(
                "max_retries must not be negative (got {})",
                self.max_retries
            )));
        }
        if self.timeout_minutes < 0 {
            return Err(WorkflowError::Validation(format!(
                "timeout_minutes must not be negative (got {})",
                self.timeout_minutes
            )));
        }
        Ok(())
    }
}

/// The durable record tracking one issue from intake to merge, close or abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    pub base_branch: String,
    pub state: WorkflowState,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub task_id: Option<i64>,
    pub workspace_id: Option<i64>,
    pub provider: String,
    #[serde(default)]
    pub config: WorkflowConfig,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_event_ts: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    pub last_error: Option<String>,
    // Mirrors of the authoritative record in the lock table.
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn matches_issue(&self, owner: &str, repo: &str, issue_number: i64) -> bool {
        self.owner == owner && self.repo == repo && self.issue_number == issue_number
    }

    /// `owner/repo#issue`, used in log lines and CLI output.
    pub fn slug(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.issue_number)
    }
}

/// Request to create (or look up) the workflow for an issue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub config: Option<WorkflowConfig>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateWorkflowRequest {
    pub fn new(owner: &str, repo: &str, issue_number: i64) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            issue_number,
            ..Default::default()
        }
    }

    pub fn with_base_branch(mut self, base_branch: &str) -> Self {
        self.base_branch = Some(base_branch.to_string());
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(WorkflowError::Validation("owner is required".into()));
        }
        if self.repo.trim().is_empty() {
            return Err(WorkflowError::Validation("repo is required".into()));
        }
        if self.issue_number <= 0 {
            return Err(WorkflowError::Validation(format!(
                "issue number must be positive (got {})",
                self.issue_number
            )));
        }
        if let Some(base) = &self.base_branch
            && base.trim().is_empty()
        {
            return Err(WorkflowError::Validation(
                "base branch must not be empty".into(),
            ));
        }
        if let Some(config) = &self.config {
            config.validate()?;
        }
        Ok(())
    }
}

/// What an update does to `last_event_ts`, the feedback cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventCursor {
    /// Bump to the time of the update.
    #[default]
    Now,
    /// Leave it where it is.
    Keep,
    At(DateTime<Utc>),
}

/// Partial update of a workflow. Only fields set to `Some` are applied.
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflowRequest {
    pub id: i64,
    pub state: Option<WorkflowState>,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub task_id: Option<i64>,
    pub workspace_id: Option<i64>,
    pub config: Option<WorkflowConfig>,
    /// Keys merged into the existing metadata map.
    pub metadata: Option<BTreeMap<String, String>>,
    pub error_count: Option<u32>,
    pub last_error: Option<String>,
    pub event_cursor: EventCursor,
}

impl UpdateWorkflowRequest {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn state(mut self, state: WorkflowState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn branch_name(mut self, branch: &str) -> Self {
        self.branch_name = Some(branch.to_string());
        self
    }

    pub fn pr_number(mut self, pr_number: i64) -> Self {
        self.pr_number = Some(pr_number);
        self
    }

    pub fn task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn workspace_id(mut self, workspace_id: i64) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn last_error(mut self, message: &str) -> Self {
        self.last_error = Some(message.to_string());
        self
    }

    pub fn error(mut self, error_count: u32, last_error: &str) -> Self {
        self.error_count = Some(error_count);
        self.last_error = Some(last_error.to_string());
        self
    }

    pub fn keep_event_cursor(mut self) -> Self {
        self.event_cursor = EventCursor::Keep;
        self
    }

    pub fn event_cursor_at(mut self, ts: DateTime<Utc>) -> Self {
        self.event_cursor = EventCursor::At(ts);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id <= 0 {
            return Err(WorkflowError::Validation(format!(
                "workflow id must be positive (got {})",
                self.id
            )));
        }
        if let Some(pr) = self.pr_number
            && pr <= 0
        {
            return Err(WorkflowError::Validation(format!(
                "pull request number must be positive (got {})",
                pr
            )));
        }
        if let Some(branch) = &self.branch_name
            && branch.trim().is_empty()
        {
            return Err(WorkflowError::Validation(
                "branch name must not be empty".into(),
            ));
        }
        for (field, value) in [("task_id", self.task_id), ("workspace_id", self.workspace_id)] {
            if let Some(v) = value
                && v <= 0
            {
                return Err(WorkflowError::Validation(format!(
                    "{} must be positive (got {})",
                    field, v
                )));
            }
        }
        if let Some(config) = &self.config {
            config.validate()?;
        }
        Ok(())
    }
}

/// Time-bounded exclusive lease on one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLock {
    pub workflow_id: i64,
    pub holder_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkflowLock {
    /// A lease is valid strictly before its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// One inbound provider notification and its processing outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub event_type: String,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub processed: bool,
    pub job_id: Option<i64>,
    pub error: Option<String>,
}

impl WorkflowEvent {
    /// The `action` field GitHub puts on most webhook payloads.
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(|a| a.as_str())
    }
}

/// Fields supplied when recording a new event.
#[derive(Debug, Clone, Default)]
pub struct NewWorkflowEvent {
    pub event_type: String,
    pub provider: String,
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl NewWorkflowEvent {
    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(WorkflowError::Validation("event type is required".into()));
        }
        if self.owner.trim().is_empty() || self.repo.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "event owner and repo are required".into(),
            ));
        }
        if self.issue_number <= 0 {
            return Err(WorkflowError::Validation(format!(
                "event issue number must be positive (got {})",
                self.issue_number
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_state_roundtrip() {
        for state in WorkflowState::ALL {
            let parsed: WorkflowState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("invalid".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&WorkflowState::WorkspaceReady).unwrap(),
            "\"workspace_ready\""
        );
        assert_eq!(
            serde_json::to_string(&SyncStrategy::Merge).unwrap(),
            "\"merge\""
        );
        assert_eq!(
            serde_json::from_str::<WorkflowState>("\"pr_open\"").unwrap(),
            WorkflowState::PrOpen
        );
    }

    #[test]
    fn test_sync_strategy_rejects_unknown_value() {
        let err = "squash".parse::<SyncStrategy>().unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!("rebase".parse::<SyncStrategy>().unwrap(), SyncStrategy::Rebase);
    }

    #[test]
    fn test_create_request_validation() {
        assert!(CreateWorkflowRequest::new("acme", "widgets", 12).validate().is_ok());
        assert!(CreateWorkflowRequest::new("", "widgets", 12).validate().is_err());
        assert!(CreateWorkflowRequest::new("acme", "  ", 12).validate().is_err());
        assert!(CreateWorkflowRequest::new("acme", "widgets", 0).validate().is_err());
        assert!(CreateWorkflowRequest::new("acme", "widgets", -3).validate().is_err());
        assert!(
            CreateWorkflowRequest::new("acme", "widgets", 1)
                .with_base_branch("")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_negative_retry_and_timeout_rejected() {
        let config = WorkflowConfig {
            max_retries: -1,
            ..Default::default()
        };
        let req = CreateWorkflowRequest::new("acme", "widgets", 1).with_config(config);
        assert!(matches!(req.validate(), Err(WorkflowError::Validation(_))));

        let config = WorkflowConfig {
            timeout_minutes: -5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_request_validation() {
        assert!(UpdateWorkflowRequest::new(0).validate().is_err());
        assert!(UpdateWorkflowRequest::new(1).pr_number(0).validate().is_err());
        assert!(UpdateWorkflowRequest::new(1).branch_name(" ").validate().is_err());
        assert!(UpdateWorkflowRequest::new(1).task_id(-2).validate().is_err());
        assert!(
            UpdateWorkflowRequest::new(1)
                .state(WorkflowState::WorkspaceReady)
                .task_id(3)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_update_request_metadata_accumulates() {
        let req = UpdateWorkflowRequest::new(1)
            .metadata("a", "1")
            .metadata("b", "2");
        let metadata = req.metadata.unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["b"], "2");
    }

    #[test]
    fn test_lock_validity_is_strict() {
        let now = Utc::now();
        let lock = WorkflowLock {
            workflow_id: 1,
            holder_id: "a".into(),
            pid: 1,
            acquired_at: now - chrono::Duration::seconds(10),
            expires_at: now,
        };
        assert!(!lock.is_valid_at(now));
        assert!(lock.is_valid_at(now - chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_workflow_config_defaults_from_empty_json() {
        let config: WorkflowConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, WorkflowConfig::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_minutes, 60);
    }
}
