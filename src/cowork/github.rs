//! GitHub REST v3 implementation of [`IssueProvider`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::*;
use super::provider::IssueProvider;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "cowork";
const PER_PAGE: usize = 100;

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Validate that a string looks like a GitHub token based on its prefix.
///
/// Format check only; it does not verify the token is active or scoped.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

// ── Wire types (subset of fields we care about) ─────────────────────────

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: i64,
    title: String,
    body: Option<String>,
    state: String,
    html_url: String,
    /// Pull requests also come through the issues endpoint; filter them out.
    pull_request: Option<serde_json::Value>,
}

impl From<GitHubIssue> for Issue {
    fn from(i: GitHubIssue) -> Self {
        Issue {
            number: i.number,
            title: i.title,
            body: i.body.unwrap_or_default(),
            state: i.state,
            html_url: i.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubPull {
    number: i64,
    state: PrState,
    #[serde(default)]
    merged: Option<bool>,
    merged_at: Option<DateTime<Utc>>,
    head: GitHubRef,
    base: GitHubRef,
    html_url: String,
}

impl From<GitHubPull> for PullRequest {
    fn from(p: GitHubPull) -> Self {
        // The list endpoint omits `merged`; `merged_at` is always present.
        let merged = p.merged.unwrap_or(p.merged_at.is_some());
        PullRequest {
            number: p.number,
            state: p.state,
            merged,
            head_branch: p.head.name,
            base_branch: p.base.name,
            html_url: p.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubReview {
    id: i64,
    state: ReviewState,
    body: Option<String>,
    user: Option<GitHubUser>,
    submitted_at: Option<DateTime<Utc>>,
}

impl From<GitHubReview> for Review {
    fn from(r: GitHubReview) -> Self {
        Review {
            id: r.id,
            state: r.state,
            body: r.body.unwrap_or_default(),
            author: r.user.map(|u| u.login).unwrap_or_default(),
            submitted_at: r.submitted_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubComment {
    id: i64,
    body: Option<String>,
    user: Option<GitHubUser>,
    created_at: DateTime<Utc>,
}

impl From<GitHubComment> for Comment {
    fn from(c: GitHubComment) -> Self {
        Comment {
            id: c.id,
            body: c.body.unwrap_or_default(),
            author: c.user.map(|u| u.login).unwrap_or_default(),
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePullBody<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
    draft: bool,
}

// ── Provider ────────────────────────────────────────────────────────────

pub struct GitHubProvider {
    client: reqwest::Client,
    api_url: String,
    web_url: String,
    token: Option<String>,
}

impl GitHubProvider {
    pub fn new(api_url: &str, token: Option<String>) -> Self {
        let api_url = api_url.trim_end_matches('/').to_string();
        let web_url = if api_url == DEFAULT_API_URL {
            "https://github.com".to_string()
        } else {
            // GitHub Enterprise serves the API under /api/v3 on the web host.
            api_url.trim_end_matches("/api/v3").to_string()
        };
        Self {
            client: reqwest::Client::new(),
            api_url,
            web_url,
            token,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        self.request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to GitHub", what))?
            .error_for_status()
            .with_context(|| format!("GitHub {} API returned error status", what))?
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response from GitHub", what))
    }

    /// Follow `page=` pagination until a short page comes back.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let resp: Vec<T> = self
                .request(reqwest::Method::GET, path)
                .query(query)
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await
                .with_context(|| format!("Failed to send {} request to GitHub", what))?
                .error_for_status()
                .with_context(|| format!("GitHub {} API returned error status", what))?
                .json()
                .await
                .with_context(|| format!("Failed to parse {} response from GitHub", what))?;

            let count = resp.len();
            all.extend(resp);
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }
}

#[async_trait]
impl IssueProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue> {
        let issue: GitHubIssue = self
            .get_json(&format!("/repos/{}/{}/issues/{}", owner, repo, number), "issue")
            .await?;
        Ok(issue.into())
    }

    async fn list_open_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>> {
        let issues: Vec<GitHubIssue> = self
            .get_paginated(
                &format!("/repos/{}/{}/issues", owner, repo),
                &[("state", "open".to_string())],
                "issues",
            )
            .await?;
        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(Issue::from)
            .collect())
    }

    async fn get_pull_request(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequest> {
        let pull: GitHubPull = self
            .get_json(&format!("/repos/{}/{}/pulls/{}", owner, repo, number), "pull request")
            .await?;
        Ok(pull.into())
    }

    async fn find_pull_request_for_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<PullRequest>> {
        let pulls: Vec<GitHubPull> = self
            .get_paginated(
                &format!("/repos/{}/{}/pulls", owner, repo),
                &[
                    ("state", "all".to_string()),
                    ("head", format!("{}:{}", owner, branch)),
                ],
                "pull requests",
            )
            .await?;
        Ok(pulls.into_iter().next().map(PullRequest::from))
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest> {
        let body = CreatePullBody {
            title: &pr.title,
            body: &pr.body,
            head: &pr.head,
            base: &pr.base,
            draft: pr.draft,
        };
        let pull: GitHubPull = self
            .request(reqwest::Method::POST, &format!("/repos/{}/{}/pulls", owner, repo))
            .json(&body)
            .send()
            .await
            .context("Failed to send create pull request to GitHub")?
            .error_for_status()
            .context("GitHub create pull request API returned error status")?
            .json()
            .await
            .context("Failed to parse create pull request response from GitHub")?;
        debug!(owner, repo, pr_number = pull.number, head = %pr.head, "Opened pull request");
        Ok(pull.into())
    }

    async fn fetch_updates(
        &self,
        owner: &str,
        repo: &str,
        pr_number: i64,
        since: DateTime<Utc>,
    ) -> Result<PullRequestUpdates> {
        let reviews: Vec<GitHubReview> = self
            .get_paginated(
                &format!("/repos/{}/{}/pulls/{}/reviews", owner, repo, pr_number),
                &[],
                "reviews",
            )
            .await?;
        let since_param = [("since", since.to_rfc3339())];
        let mut comments: Vec<GitHubComment> = self
            .get_paginated(
                &format!("/repos/{}/{}/issues/{}/comments", owner, repo, pr_number),
                &since_param,
                "issue comments",
            )
            .await?;
        comments.extend(
            self.get_paginated::<GitHubComment>(
                &format!("/repos/{}/{}/pulls/{}/comments", owner, repo, pr_number),
                &since_param,
                "review comments",
            )
            .await?,
        );

        // `since` on the comment endpoints is inclusive and filters on update
        // time; filter on creation time here.
        let reviews: Vec<Review> = reviews
            .into_iter()
            .filter(|r| r.submitted_at.is_some_and(|t| t > since))
            .map(Review::from)
            .collect();
        let mut comments: Vec<Comment> = comments
            .into_iter()
            .filter(|c| c.created_at > since)
            .map(Comment::from)
            .collect();
        comments.sort_by_key(|c| c.created_at);

        Ok(PullRequestUpdates { reviews, comments })
    }

    async fn delete_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/repos/{}/{}/git/refs/heads/{}", owner, repo, branch),
            )
            .send()
            .await
            .context("Failed to send delete branch request to GitHub")?;
        // 422 means the ref is already gone.
        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            debug!(owner, repo, branch, "Branch already deleted");
            return Ok(());
        }
        resp.error_for_status()
            .context("GitHub delete branch API returned error status")?;
        Ok(())
    }

    async fn comment_on_issue(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        body: &str,
    ) -> Result<Comment> {
        let comment: GitHubComment = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/issues/{}/comments", owner, repo, number),
            )
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to send issue comment to GitHub")?
            .error_for_status()
            .context("GitHub issue comment API returned error status")?
            .json()
            .await
            .context("Failed to parse issue comment response from GitHub")?;
        Ok(comment.into())
    }

    fn clone_url(&self, owner: &str, repo: &str) -> String {
        match &self.token {
            Some(token) => {
                let host = self
                    .web_url
                    .strip_prefix("https://")
                    .unwrap_or(&self.web_url);
                format!("https://x-access-token:{}@{}/{}/{}.git", token, host, owner, repo)
            }
            None => format!("{}/{}/{}.git", self.web_url, owner, repo),
        }
    }
}
