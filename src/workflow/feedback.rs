//! Maps a batch of pull request review activity to what the author wants.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cowork::models::{Comment, Review, ReviewState};

/// Keywords that mark a plain comment as a change request.
const CHANGE_KEYWORDS: &[&str] = &["change", "fix", "update"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackIntent {
    /// A question or remark; no code change needed.
    Ask,
    /// A comment asking for a change.
    Change,
    /// A formal "changes requested" review.
    Blocker,
}

impl FeedbackIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::Change => "change",
            Self::Blocker => "blocker",
        }
    }

    /// Whether the workflow should go back to revising.
    pub fn requires_revision(&self) -> bool {
        matches!(self, Self::Change | Self::Blocker)
    }
}

impl std::fmt::Display for FeedbackIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(Self::Ask),
            "change" => Ok(Self::Change),
            "blocker" => Ok(Self::Blocker),
            _ => Err(format!("Invalid feedback intent: {}", s)),
        }
    }
}

/// Any `changes_requested` review wins; otherwise the first comment mentioning
/// a change keyword; otherwise it's a question.
pub fn classify_feedback(reviews: &[Review], comments: &[Comment]) -> FeedbackIntent {
    if reviews
        .iter()
        .any(|r| r.state == ReviewState::ChangesRequested)
    {
        return FeedbackIntent::Blocker;
    }
    let wants_change = comments.iter().any(|c| {
        let body = c.body.to_lowercase();
        CHANGE_KEYWORDS.iter().any(|k| body.contains(k))
    });
    if wants_change {
        FeedbackIntent::Change
    } else {
        FeedbackIntent::Ask
    }
}
