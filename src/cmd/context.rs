//! Wiring shared by every command that touches workflow state.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use cowork::config::CoworkConfig;
use cowork::cowork::{
    Cowork, GitCli, GitHubProvider, GitOps, IssueProvider, TaskService, TaskStore,
    WorkspaceService, WorkspaceStore,
};
use cowork::workflow::{
    Collaborators, Engine, EngineSettings, EventQueue, IdAllocator, LockCoordinator,
    WorkflowStore,
};

pub struct AppContext {
    pub config: CoworkConfig,
    pub store: Arc<WorkflowStore>,
    pub locks: Arc<LockCoordinator>,
    pub events: EventQueue,
    pub engine: Engine,
}

impl AppContext {
    pub fn open(config: CoworkConfig) -> Result<Self> {
        let ids = Arc::new(IdAllocator::new());
        let store = Arc::new(
            WorkflowStore::open(&config.data_dir, ids.clone()).with_context(|| {
                format!("Failed to open workflow store at {}", config.data_dir.display())
            })?,
        );
        let locks = Arc::new(LockCoordinator::new(store.clone()));
        let events = EventQueue::new(store.clone());

        let provider: Arc<dyn IssueProvider> = Arc::new(GitHubProvider::new(
            &config.toml.github.api_url,
            config.github_token(),
        ));
        let tasks: Arc<dyn TaskService> = Arc::new(TaskStore::open(&config.data_dir, ids.clone())?);
        let workspaces: Arc<dyn WorkspaceService> = Arc::new(WorkspaceStore::open(
            &config.data_dir,
            &config.workspace_root,
            ids,
        )?);
        let git: Arc<dyn GitOps> = Arc::new(GitCli::new());
        let cowork = Arc::new(Cowork::new(
            provider.clone(),
            tasks.clone(),
            workspaces.clone(),
            git.clone(),
        ));

        let settings = EngineSettings {
            holder_id: config.holder_id.clone(),
            lease_ttl: config.lease_ttl,
            base_branch: config.toml.defaults.base_branch.clone(),
            workflow_config: config.workflow_defaults(),
        };
        debug!(
            data_dir = %config.data_dir.display(),
            holder = %settings.holder_id,
            ttl_secs = settings.lease_ttl.as_secs(),
            "Opened cowork state"
        );

        let engine = Engine::new(
            store.clone(),
            locks.clone(),
            Collaborators {
                provider,
                tasks,
                workspaces,
                git,
                cowork,
            },
            settings,
        );

        Ok(Self {
            config,
            store,
            locks,
            events,
            engine,
        })
    }
}
