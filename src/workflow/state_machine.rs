//! Static transition table for workflow states.
//!
//! ```text
//! queued → workspace_ready → implementing → pr_open ⇄ revising → merged | closed
//!    └────────────┴──────────────┴─────────────┴─────────┴──→ aborted
//! ```
//!
//! `merged`, `closed` and `aborted` have no outgoing edges. Self-transitions are
//! not edges either.

use super::models::WorkflowState::{self, *};

/// States reachable in one step from `from`.
pub fn valid_transitions(from: WorkflowState) -> &'static [WorkflowState] {
    match from {
        Queued => &[WorkspaceReady, Aborted],
        WorkspaceReady => &[Implementing, Aborted],
        Implementing => &[PrOpen, Aborted],
        PrOpen => &[Revising, Merged, Closed, Aborted],
        Revising => &[PrOpen, Merged, Closed, Aborted],
        Merged | Closed | Aborted => &[],
    }
}

pub fn can_transition_to(from: WorkflowState, to: WorkflowState) -> bool {
    valid_transitions(from).contains(&to)
}

pub fn is_terminal(state: WorkflowState) -> bool {
    valid_transitions(state).is_empty()
}
