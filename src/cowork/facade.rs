//! The task/workspace/pull-request façade the engine drives.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::git::GitOps;
use super::models::*;
use super::provider::IssueProvider;
use super::tasks::TaskService;
use super::workspaces::WorkspaceService;

#[async_trait]
pub trait CoworkProvider: Send + Sync {
    async fn create_task_from_issue(&self, owner: &str, repo: &str, issue: &Issue) -> Result<Task>;

    /// Workspace owned by `task`, cloned at `base_branch` with `branch` checked out.
    async fn create_workspace_for_task(
        &self,
        task: &Task,
        base_branch: &str,
        branch: &str,
    ) -> Result<Workspace>;

    /// Push the workspace branch and open (or find) its pull request.
    async fn create_pull_request_for_task(
        &self,
        task: &Task,
        workspace: &Workspace,
        draft: bool,
    ) -> Result<PullRequest>;

    async fn scan_open_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>>;

    /// Pull requests opened for known tasks' branches, recording any the
    /// task store didn't know about.
    async fn scan_pull_requests_for_known_tasks(&self) -> Result<Vec<(i64, PullRequest)>>;

    /// Post the task's status on its issue.
    async fn sync_task_status_to_provider(&self, task: &Task) -> Result<()>;
}

pub struct Cowork {
    provider: Arc<dyn IssueProvider>,
    tasks: Arc<dyn TaskService>,
    workspaces: Arc<dyn WorkspaceService>,
    git: Arc<dyn GitOps>,
}

impl Cowork {
    pub fn new(
        provider: Arc<dyn IssueProvider>,
        tasks: Arc<dyn TaskService>,
        workspaces: Arc<dyn WorkspaceService>,
        git: Arc<dyn GitOps>,
    ) -> Self {
        Self {
            provider,
            tasks,
            workspaces,
            git,
        }
    }

    async fn prepare_checkout(
        &self,
        ws: &Workspace,
        base_branch: &str,
        branch: &str,
    ) -> Result<()> {
        let url = self.provider.clone_url(&ws.owner, &ws.repo);
        self.git
            .clone_repo(&url, &ws.path, base_branch)
            .await
            .context("Failed to clone repository")?;
        self.git
            .create_branch(&ws.path, branch)
            .await
            .context("Failed to create working branch")?;
        Ok(())
    }
}

fn pull_request_body(task: &Task) -> String {
    let description = if task.description.trim().is_empty() {
        "No description provided."
    } else {
        task.description.as_str()
    };
    format!(
        "## Summary\n\nAutomated implementation for: **{}**\n\nCloses #{}\n\n{}\n\n---\n*Created by cowork*",
        task.title, task.issue_number, description
    )
}

#[async_trait]
impl CoworkProvider for Cowork {
    async fn create_task_from_issue(&self, owner: &str, repo: &str, issue: &Issue) -> Result<Task> {
        self.tasks
            .create_task(NewTask {
                owner: owner.to_string(),
                repo: repo.to_string(),
                issue_number: issue.number,
                title: issue.title.clone(),
                description: issue.body.clone(),
            })
            .await
            .with_context(|| format!("Failed to create task for issue #{}", issue.number))
    }

    async fn create_workspace_for_task(
        &self,
        task: &Task,
        base_branch: &str,
        branch: &str,
    ) -> Result<Workspace> {
        let ws = self
            .workspaces
            .create_workspace_for_task(
                task.id,
                NewWorkspace {
                    owner: task.owner.clone(),
                    repo: task.repo.clone(),
                    branch: branch.to_string(),
                    base_branch: base_branch.to_string(),
                },
            )
            .await?;
        if ws.path.exists() {
            debug!(workspace_id = ws.id, "Workspace already checked out");
            return Ok(ws);
        }

        if let Err(e) = self.prepare_checkout(&ws, base_branch, branch).await {
            if let Err(cleanup) = self.workspaces.delete_workspace(ws.id).await {
                warn!(workspace_id = ws.id, error = %cleanup, "Failed to roll back workspace");
            }
            return Err(e);
        }
        info!(workspace_id = ws.id, task_id = task.id, branch, "Workspace ready");
        Ok(ws)
    }

    async fn create_pull_request_for_task(
        &self,
        task: &Task,
        workspace: &Workspace,
        draft: bool,
    ) -> Result<PullRequest> {
        self.git
            .push_branch(&workspace.path, &workspace.branch)
            .await
            .context("Failed to push workspace branch")?;

        let existing = self
            .provider
            .find_pull_request_for_branch(&task.owner, &task.repo, &workspace.branch)
            .await?
            .filter(|pr| pr.state == PrState::Open);
        let pr = match existing {
            Some(pr) => pr,
            None => {
                self.provider
                    .create_pull_request(
                        &task.owner,
                        &task.repo,
                        &NewPullRequest {
                            title: task.title.clone(),
                            body: pull_request_body(task),
                            head: workspace.branch.clone(),
                            base: workspace.base_branch.clone(),
                            draft,
                        },
                    )
                    .await?
            }
        };
        self.tasks.set_task_pr(task.id, pr.number).await?;
        Ok(pr)
    }

    async fn scan_open_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>> {
        self.provider.list_open_issues(owner, repo).await
    }

    async fn scan_pull_requests_for_known_tasks(&self) -> Result<Vec<(i64, PullRequest)>> {
        let mut found = Vec::new();
        for task in self.tasks.list_tasks().await? {
            let Some(ws) = self.workspaces.get_workspace(task.id).await? else {
                continue;
            };
            let Some(pr) = self
                .provider
                .find_pull_request_for_branch(&task.owner, &task.repo, &ws.branch)
                .await?
            else {
                continue;
            };
            if task.pr_number != Some(pr.number) {
                self.tasks.set_task_pr(task.id, pr.number).await?;
            }
            found.push((task.id, pr));
        }
        Ok(found)
    }

    async fn sync_task_status_to_provider(&self, task: &Task) -> Result<()> {
        let mut body = format!("cowork: task #{} is **{}**", task.id, task.status);
        if let Some(pr) = task.pr_number {
            body.push_str(&format!(" (PR #{})", pr));
        }
        if let Some(err) = &task.error_message {
            body.push_str(&format!("\n\n> {}", err));
        }
        self.provider
            .comment_on_issue(&task.owner, &task.repo, task.issue_number, &body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory provider and git doubles shared by façade and engine tests.

    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};

    use super::*;

    #[derive(Default)]
    pub struct MockProvider {
        pub issues: Mutex<HashMap<i64, Issue>>,
        pub pulls: Mutex<HashMap<i64, PullRequest>>,
        pub updates: Mutex<PullRequestUpdates>,
        pub created_pulls: Mutex<Vec<NewPullRequest>>,
        pub deleted_branches: Mutex<Vec<String>>,
        pub comments: Mutex<Vec<(i64, String)>>,
        pub fail_delete_branch: Mutex<bool>,
        pub fail_get_issue: Mutex<bool>,
        pub fail_fetch_updates: Mutex<bool>,
    }

    impl MockProvider {
        pub fn with_issue(number: i64, title: &str) -> Self {
            let provider = Self::default();
            provider.issues.lock().unwrap().insert(
                number,
                Issue {
                    number,
                    title: title.to_string(),
                    body: "body".to_string(),
                    state: "open".to_string(),
                    html_url: String::new(),
                },
            );
            provider
        }

        pub fn set_pull(&self, number: i64, state: PrState, merged: bool) {
            self.pulls.lock().unwrap().insert(
                number,
                PullRequest {
                    number,
                    state,
                    merged,
                    head_branch: String::new(),
                    base_branch: "main".into(),
                    html_url: String::new(),
                },
            );
        }
    }

    #[async_trait]
    impl IssueProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn get_issue(&self, _owner: &str, _repo: &str, number: i64) -> Result<Issue> {
            if *self.fail_get_issue.lock().unwrap() {
                anyhow::bail!("HTTP 502");
            }
            self.issues
                .lock()
                .unwrap()
                .get(&number)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("issue {} not found", number))
        }

        async fn list_open_issues(&self, _owner: &str, _repo: &str) -> Result<Vec<Issue>> {
            let mut issues: Vec<Issue> = self.issues.lock().unwrap().values().cloned().collect();
            issues.sort_by_key(|i| i.number);
            Ok(issues)
        }

        async fn get_pull_request(&self, _o: &str, _r: &str, number: i64) -> Result<PullRequest> {
            self.pulls
                .lock()
                .unwrap()
                .get(&number)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("pull {} not found", number))
        }

        async fn find_pull_request_for_branch(
            &self,
            _o: &str,
            _r: &str,
            branch: &str,
        ) -> Result<Option<PullRequest>> {
            Ok(self
                .pulls
                .lock()
                .unwrap()
                .values()
                .find(|p| p.head_branch == branch)
                .cloned())
        }

        async fn create_pull_request(
            &self,
            _o: &str,
            _r: &str,
            pr: &NewPullRequest,
        ) -> Result<PullRequest> {
            let number = 100 + self.created_pulls.lock().unwrap().len() as i64;
            self.created_pulls.lock().unwrap().push(pr.clone());
            let created = PullRequest {
                number,
                state: PrState::Open,
                merged: false,
                head_branch: pr.head.clone(),
                base_branch: pr.base.clone(),
                html_url: String::new(),
            };
            self.pulls.lock().unwrap().insert(number, created.clone());
            Ok(created)
        }

        async fn fetch_updates(
            &self,
            _o: &str,
            _r: &str,
            _pr: i64,
            since: DateTime<Utc>,
        ) -> Result<PullRequestUpdates> {
            if *self.fail_fetch_updates.lock().unwrap() {
                anyhow::bail!("HTTP 503");
            }
            let all = self.updates.lock().unwrap();
            Ok(PullRequestUpdates {
                reviews: all
                    .reviews
                    .iter()
                    .filter(|r| r.submitted_at.is_some_and(|t| t > since))
                    .cloned()
                    .collect(),
                comments: all
                    .comments
                    .iter()
                    .filter(|c| c.created_at > since)
                    .cloned()
                    .collect(),
            })
        }

        async fn delete_branch(&self, _o: &str, _r: &str, branch: &str) -> Result<()> {
            if *self.fail_delete_branch.lock().unwrap() {
                anyhow::bail!("branch protected");
            }
            self.deleted_branches.lock().unwrap().push(branch.to_string());
            Ok(())
        }

        async fn comment_on_issue(
            &self,
            _o: &str,
            _r: &str,
            number: i64,
            body: &str,
        ) -> Result<Comment> {
            self.comments.lock().unwrap().push((number, body.to_string()));
            Ok(Comment {
                id: 1,
                body: body.to_string(),
                author: "cowork".into(),
                created_at: Utc::now(),
            })
        }

        fn clone_url(&self, owner: &str, repo: &str) -> String {
            format!("mock://{}/{}", owner, repo)
        }
    }

    /// Git double: clone creates the directory, everything else is recorded.
    #[derive(Default)]
    pub struct MockGit {
        pub calls: Mutex<Vec<String>>,
        pub fail_clone: Mutex<bool>,
        pub fail_rebase: Mutex<bool>,
        pub fail_merge: Mutex<bool>,
    }

    impl MockGit {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl GitOps for MockGit {
        async fn clone_repo(&self, _url: &str, dest: &Path, _base: &str) -> Result<()> {
            self.record("clone".into());
            if *self.fail_clone.lock().unwrap() {
                anyhow::bail!("clone failed");
            }
            std::fs::create_dir_all(dest)?;
            Ok(())
        }

        async fn create_branch(&self, _dir: &Path, branch: &str) -> Result<()> {
            self.record(format!("branch {}", branch));
            Ok(())
        }

        async fn push_branch(&self, _dir: &Path, branch: &str) -> Result<()> {
            self.record(format!("push {}", branch));
            Ok(())
        }

        async fn rebase_onto(&self, _dir: &Path, base: &str) -> Result<()> {
            self.record(format!("rebase {}", base));
            if *self.fail_rebase.lock().unwrap() {
                anyhow::bail!("rebase conflict");
            }
            Ok(())
        }

        async fn merge_from(&self, _dir: &Path, base: &str) -> Result<()> {
            self.record(format!("merge {}", base));
            if *self.fail_merge.lock().unwrap() {
                anyhow::bail!("merge conflict");
            }
            Ok(())
        }
    }

    pub fn workspace_root(dir: &Path) -> PathBuf {
        dir.join("workspaces")
    }
}
