//! Append-only record of inbound provider events.

use std::sync::Arc;

use crate::errors::Result;

use super::models::{NewWorkflowEvent, WorkflowEvent};
use super::store::WorkflowStore;

/// Thin queue view over the store's event collection. Processed events stay
/// in the collection for audit but are never returned by [`pending`](Self::pending).
#[derive(Clone)]
pub struct EventQueue {
    store: Arc<WorkflowStore>,
}

impl EventQueue {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, event: NewWorkflowEvent) -> Result<WorkflowEvent> {
        self.store.create_event(event)
    }

    pub fn get(&self, id: &str) -> Result<WorkflowEvent> {
        self.store.get_event(id)
    }

    /// Unprocessed events, oldest first.
    pub fn pending(&self) -> Result<Vec<WorkflowEvent>> {
        self.store.list_unprocessed_events()
    }

    pub fn all(&self) -> Result<Vec<WorkflowEvent>> {
        self.store.list_events()
    }

    pub fn mark_processed(
        &self,
        event_id: &str,
        workflow_id: Option<i64>,
        error: Option<String>,
    ) -> Result<WorkflowEvent> {
        self.store.mark_event_processed(event_id, workflow_id, error)
    }
}
