//! Workflow orchestration core.
//!
//! ## Overview
//!
//! One workflow per issue moves through a fixed state machine from intake to
//! a merged, closed or aborted pull request. A driver calls
//! [`Engine::process_workflow`] repeatedly; each call holds a time-bounded
//! lease so two processes never advance the same workflow at once, and the
//! [`Watchdog`] reclaims leases a crashed process left behind.
//!
//! ## Module Map
//!
//! ```text
//!   driver (CLI `run`, webhook server)
//!        │ process_workflow(id) / process_pending_events(queue)
//!        v
//!   engine.rs ──────────────> cowork::{IssueProvider, TaskService,
//!        │                            WorkspaceService, GitOps, CoworkProvider}
//!        │ lock / unlock
//!        v
//!   lock.rs (LockCoordinator) <── watchdog.rs (sweep_expired every tick)
//!        │
//!        v
//!   store.rs (WorkflowStore: workflows, events, locks)
//!        │
//!        v
//!   persist.rs (atomic JSON replace)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `models`        | `Workflow`, `WorkflowState`, `WorkflowLock`, events   |
//! | `state_machine` | Static transition table                               |
//! | `ids`           | Shared and workspace ID counters                      |
//! | `feedback`      | Review activity to `FeedbackIntent`                   |
//! | `events`        | `EventQueue` view over stored events                  |

pub mod engine;
pub mod events;
pub mod feedback;
pub mod ids;
pub mod lock;
pub mod models;
pub mod persist;
pub mod state_machine;
pub mod store;
pub mod watchdog;

pub use engine::{Collaborators, Engine, EngineSettings};
pub use events::EventQueue;
pub use feedback::{FeedbackIntent, classify_feedback};
pub use ids::IdAllocator;
pub use lock::LockCoordinator;
pub use models::{
    CreateWorkflowRequest, EventCursor, NewWorkflowEvent, SyncStrategy, UpdateWorkflowRequest,
    Workflow, WorkflowConfig, WorkflowEvent, WorkflowLock, WorkflowState,
};
pub use store::WorkflowStore;
pub use watchdog::Watchdog;
