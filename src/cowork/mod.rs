//! Collaborators the workflow engine drives: the issue provider, the task and
//! workspace registries, git, and the façade tying them together.

pub mod facade;
pub mod git;
pub mod github;
pub mod models;
pub mod provider;
pub mod tasks;
pub mod workspaces;

pub use facade::{Cowork, CoworkProvider};
pub use git::{GitCli, GitOps};
pub use github::GitHubProvider;
pub use provider::IssueProvider;
pub use tasks::{TaskService, TaskStore};
pub use workspaces::{WorkspaceService, WorkspaceStore};
