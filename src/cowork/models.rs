use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An issue as the engine sees it, independent of provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub state: PrState,
    /// Only meaningful once `state` is closed.
    pub merged: bool,
    pub head_branch: String,
    pub base_branch: String,
    pub html_url: String,
}

impl PullRequest {
    pub fn is_merged(&self) -> bool {
        self.state == PrState::Closed && self.merged
    }
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub state: ReviewState,
    #[serde(default)]
    pub body: String,
    pub author: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// Review activity on a pull request since some point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullRequestUpdates {
    pub reviews: Vec<Review>,
    pub comments: Vec<Comment>,
}

impl PullRequestUpdates {
    pub fn is_empty(&self) -> bool {
        self.reviews.is_empty() && self.comments.is_empty()
    }

    /// Newest review submission or comment creation time in the batch.
    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        let reviews = self.reviews.iter().filter_map(|r| r.submitted_at);
        let comments = self.comments.iter().map(|c| c.created_at);
        reviews.chain(comments).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A unit of agent work created from an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub branch: Option<String>,
    pub pr_number: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    pub title: String,
    pub description: String,
}

/// A checked-out working copy the agent operates in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub task_id: Option<i64>,
    pub owner: String,
    pub repo: String,
    pub path: std::path::PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewWorkspace {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub base_branch: String,
}
