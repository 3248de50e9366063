//! Typed error hierarchy for the workflow core.
//!
//! `WorkflowError` covers everything the store, lease coordinator and engine
//! can report. Collaborators (provider, git, task/workspace services) speak
//! `anyhow` and are wrapped into `WorkflowError::Collaborator` with the name of
//! the step that failed.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::workflow::models::WorkflowState;

/// Errors from the workflow store, lease coordinator and engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: i64 },

    #[error("Workflow event {id} not found")]
    EventNotFound { id: String },

    #[error("No lock held on workflow {workflow_id}")]
    LockNotFound { workflow_id: i64 },

    #[error("Workflow {workflow_id} is locked by {holder} until {expires_at}")]
    AlreadyLocked {
        workflow_id: i64,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Workflow {workflow_id} is locked by {holder}, not {requested_by}")]
    NotLockHolder {
        workflow_id: i64,
        holder: String,
        requested_by: String,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("Workflow {id} is in terminal state {state}")]
    TerminalState { id: i64, state: WorkflowState },

    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Workflow store lock poisoned")]
    LockPoisoned,

    #[error("{step} failed: {source:#}")]
    Collaborator {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    /// Wrap a collaborator failure with the name of the step that produced it.
    pub fn collaborator(step: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Collaborator { step, source }
    }

    /// True when the error means "someone else holds the lease, try later".
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::AlreadyLocked { .. } | Self::NotLockHolder { .. })
    }
}

/// Result alias used throughout the workflow core.
pub type Result<T> = std::result::Result<T, WorkflowError>;
