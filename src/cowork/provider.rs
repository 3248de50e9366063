use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Comment, Issue, NewPullRequest, PullRequest, PullRequestUpdates};
use crate::util::issue_branch_name;

/// Source of issues and pull requests (GitHub, or a mock in tests).
#[async_trait]
pub trait IssueProvider: Send + Sync {
    /// Short provider name stored on workflows and events.
    fn name(&self) -> &str;

    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue>;

    /// Open issues only; pull requests are filtered out.
    async fn list_open_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>>;

    async fn get_pull_request(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequest>;

    async fn find_pull_request_for_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<PullRequest>>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest>;

    /// Reviews and comments on a pull request newer than `since`.
    async fn fetch_updates(
        &self,
        owner: &str,
        repo: &str,
        pr_number: i64,
        since: DateTime<Utc>,
    ) -> Result<PullRequestUpdates>;

    async fn delete_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<()>;

    async fn comment_on_issue(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        body: &str,
    ) -> Result<Comment>;

    /// URL to clone from. May embed credentials; never log it.
    fn clone_url(&self, owner: &str, repo: &str) -> String;

    fn branch_name_for_issue(&self, issue: &Issue) -> String {
        issue_branch_name(issue.number, &issue.title)
    }
}
