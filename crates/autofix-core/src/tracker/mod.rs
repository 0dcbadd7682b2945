//! Upstream issue-tracker capability.
//!
//! The pipeline opens review requests and updates issue metadata through
//! [`IssueTracker`]; the GitHub REST implementation lives in
//! [`github::GitHubTracker`]. Swapping trackers requires no core changes.

pub mod github;
mod error;

pub use error::TrackerError;

use std::future::Future;

use serde::{Deserialize, Serialize};

/// Request to open a review request upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequestSpec {
    pub title: String,
    pub body: String,
    /// Head branch carrying the fix.
    pub head: String,
    /// Base branch the request targets.
    pub base: String,
    #[serde(default)]
    pub issue_numbers: Vec<u64>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub draft: bool,
}

/// An opened review request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

/// A batched issue-metadata update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueUpdate {
    #[serde(default)]
    pub state: Option<IssueState>,
    #[serde(default)]
    pub add_labels: Vec<String>,
    #[serde(default)]
    pub remove_labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Capability the pipeline consumes for `pr_create` and `issue_update`.
pub trait IssueTracker: Send + Sync {
    fn create_review_request(
        &self,
        spec: &ReviewRequestSpec,
    ) -> impl Future<Output = Result<ReviewRequest, TrackerError>> + Send;

    fn update_issue(
        &self,
        number: u64,
        update: &IssueUpdate,
    ) -> impl Future<Output = Result<(), TrackerError>> + Send;
}

pub const LABEL_QUEUED: &str = "auto-fix:queued";
pub const LABEL_IN_PROGRESS: &str = "auto-fix:in-progress";
pub const LABEL_FIXED: &str = "auto-fix:fixed";
pub const LABEL_FAILED: &str = "auto-fix:failed";

/// Label transition and templated comment for an issue entering repair.
pub fn in_progress_update(pr: &ReviewRequest) -> IssueUpdate {
    IssueUpdate {
        state: None,
        add_labels: vec![LABEL_IN_PROGRESS.into()],
        remove_labels: vec![LABEL_QUEUED.into(), LABEL_FAILED.into()],
        assignees: vec![],
        comment: Some(format!(
            "An automated fix is in review: {} (#{}).",
            pr.url, pr.number
        )),
    }
}

/// Label transition and templated comment for an issue whose fix merged.
pub fn fixed_update(pr: &ReviewRequest) -> IssueUpdate {
    IssueUpdate {
        state: None,
        add_labels: vec![LABEL_FIXED.into()],
        remove_labels: vec![LABEL_IN_PROGRESS.into()],
        assignees: vec![],
        comment: Some(format!("Fixed by #{} ({}).", pr.number, pr.url)),
    }
}

/// Label transition and templated comment for a repair that gave up.
pub fn failed_update(reason: &str) -> IssueUpdate {
    IssueUpdate {
        state: None,
        add_labels: vec![LABEL_FAILED.into()],
        remove_labels: vec![LABEL_IN_PROGRESS.into()],
        assignees: vec![],
        comment: Some(format!(
            "Automated repair did not succeed: {reason}. A human should take a look."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_transition() {
        let pr = ReviewRequest {
            number: 123,
            url: "https://github.com/acme/widgets/pull/123".into(),
        };
        let update = in_progress_update(&pr);
        assert_eq!(update.add_labels, vec![LABEL_IN_PROGRESS]);
        assert!(update.remove_labels.contains(&LABEL_QUEUED.to_string()));
        assert!(update.comment.unwrap().contains("#123"));
        assert!(update.state.is_none());
    }

    #[test]
    fn fixed_transition() {
        let pr = ReviewRequest {
            number: 7,
            url: "u".into(),
        };
        let update = fixed_update(&pr);
        assert_eq!(update.add_labels, vec![LABEL_FIXED]);
        assert_eq!(update.remove_labels, vec![LABEL_IN_PROGRESS]);
        assert!(update.comment.unwrap().starts_with("Fixed by #7"));
    }

    #[test]
    fn failed_transition_keeps_issue_open() {
        let update = failed_update("checks kept failing");
        assert_eq!(update.add_labels, vec![LABEL_FAILED]);
        assert!(update.state.is_none());
        assert!(update.comment.unwrap().contains("checks kept failing"));
    }
}
