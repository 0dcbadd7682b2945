//! Issue and issue-group data model.
//!
//! An [`IssueGroup`] is the unit of work: a cohesive bundle of issues fixed
//! on one branch and proposed through one review request.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AutofixError, Result};

/// Issue classification, mirrored into `type:<..>` labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    Refactor,
    Docs,
    Chore,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Chore => "chore",
        }
    }
}

/// Priority, mirrored into `priority:<..>` labels. Ordered highest first so
/// the aggregate priority of a group is the minimum over its issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuePriority {
    Critical,
    High,
    Medium,
    Low,
}

impl IssuePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// A single upstream issue as ingested from the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub issue_type: IssueType,
    pub priority: IssuePriority,
    #[serde(default)]
    pub assignees: Vec<String>,
    /// File paths the issue text hints at.
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default)]
    pub related_issues: Vec<u64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Immutable input to one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueGroup {
    /// Stable id, unique across a queue run.
    pub id: String,
    /// Display name used in review-request titles and log lines.
    pub name: String,
    /// The key the grouping step bucketed these issues under.
    pub grouping_key: String,
    /// Target branch, `fix/<slug>[-<n1-n2-n3>[-and-more]]`.
    pub branch: String,
    pub issues: Vec<Issue>,
    /// Components touched, mirrored into `component:<..>` labels.
    #[serde(default)]
    pub components: Vec<String>,
    /// Aggregate priority (highest of the member issues).
    pub priority: IssuePriority,
    /// Merged related-file set across the member issues.
    #[serde(default)]
    pub related_files: Vec<String>,
}

fn branch_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^fix/[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid branch regex"))
}

/// Build the canonical branch name for a slug and the member issue numbers.
///
/// At most three numbers are embedded; larger groups get an `-and-more`
/// suffix instead of an unbounded branch name.
pub fn branch_for(slug: &str, issue_numbers: &[u64]) -> String {
    let slug = slugify(slug);
    if issue_numbers.is_empty() {
        return format!("fix/{slug}");
    }
    let shown: Vec<String> = issue_numbers.iter().take(3).map(u64::to_string).collect();
    let mut branch = format!("fix/{slug}-{}", shown.join("-"));
    if issue_numbers.len() > 3 {
        branch.push_str("-and-more");
    }
    branch
}

/// Lowercase and collapse anything outside `[a-z0-9]` into single dashes.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

impl IssueGroup {
    /// Member issue numbers in group order.
    pub fn issue_numbers(&self) -> Vec<u64> {
        self.issues.iter().map(|i| i.number).collect()
    }

    /// Labels attached to the review request: always `auto-fix`, plus
    /// `type:` when the members agree on one, `priority:` for the aggregate,
    /// and one `component:` per touched component.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = vec!["auto-fix".to_string()];

        let mut types = self.issues.iter().map(|i| i.issue_type);
        if let Some(first) = types.next() {
            if types.all(|t| t == first) {
                labels.push(format!("type:{}", first.as_str()));
            }
        }

        labels.push(format!("priority:{}", self.priority.as_str()));

        for component in &self.components {
            labels.push(format!("component:{}", slugify(component)));
        }

        labels
    }

    /// Commit subject line summarizing the group.
    pub fn commit_subject(&self) -> String {
        let numbers: Vec<String> = self
            .issue_numbers()
            .iter()
            .map(|n| format!("#{n}"))
            .collect();
        format!("fix: {} ({})", self.name, numbers.join(", "))
    }

    /// Review-request body: one line per member issue, each closing it.
    pub fn review_request_body(&self) -> String {
        let mut body = String::from("Automated fix for:\n\n");
        for issue in &self.issues {
            body.push_str(&format!("- Closes #{}: {}\n", issue.number, issue.title));
        }
        body
    }

    /// Check the structural invariants: non-empty issue list and the
    /// `fix/<slug>` branch convention.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AutofixError::Config(format!(
                "group '{}' has an empty id",
                self.name
            )));
        }
        if self.issues.is_empty() {
            return Err(AutofixError::Config(format!(
                "group '{}' has no issues",
                self.id
            )));
        }
        if !branch_pattern().is_match(&self.branch) {
            return Err(AutofixError::Config(format!(
                "group '{}' branch '{}' does not match fix/<slug>",
                self.id, self.branch
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(number: u64, issue_type: IssueType) -> Issue {
        Issue {
            number,
            title: format!("issue {number}"),
            body: String::new(),
            labels: vec![],
            issue_type,
            priority: IssuePriority::Medium,
            assignees: vec![],
            related_files: vec![],
            related_issues: vec![],
            acceptance_criteria: vec![],
            source_url: None,
        }
    }

    fn group(issues: Vec<Issue>) -> IssueGroup {
        let numbers: Vec<u64> = issues.iter().map(|i| i.number).collect();
        IssueGroup {
            id: "g-1".into(),
            name: "login timeout".into(),
            grouping_key: "auth".into(),
            branch: branch_for("login timeout", &numbers),
            issues,
            components: vec!["auth".into()],
            priority: IssuePriority::High,
            related_files: vec![],
        }
    }

    #[test]
    fn branch_embeds_up_to_three_numbers() {
        assert_eq!(branch_for("login", &[12]), "fix/login-12");
        assert_eq!(branch_for("login", &[12, 14, 15]), "fix/login-12-14-15");
        assert_eq!(
            branch_for("login", &[12, 14, 15, 16]),
            "fix/login-12-14-15-and-more"
        );
    }

    #[test]
    fn branch_without_numbers() {
        assert_eq!(branch_for("Flaky Timeout!", &[]), "fix/flaky-timeout");
    }

    #[test]
    fn slugify_collapses_runs() {
        assert_eq!(slugify("Auth / Login  (v2)"), "auth-login-v2");
        assert_eq!(slugify("--already--dashed--"), "already-dashed");
    }

    #[test]
    fn labels_include_type_when_uniform() {
        let g = group(vec![issue(1, IssueType::Bug), issue(2, IssueType::Bug)]);
        let labels = g.labels();
        assert!(labels.contains(&"auto-fix".to_string()));
        assert!(labels.contains(&"type:bug".to_string()));
        assert!(labels.contains(&"priority:high".to_string()));
        assert!(labels.contains(&"component:auth".to_string()));
    }

    #[test]
    fn labels_omit_type_when_mixed() {
        let g = group(vec![issue(1, IssueType::Bug), issue(2, IssueType::Docs)]);
        assert!(!g.labels().iter().any(|l| l.starts_with("type:")));
    }

    #[test]
    fn validate_rejects_empty_issue_list() {
        let mut g = group(vec![issue(1, IssueType::Bug)]);
        g.issues.clear();
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_branch() {
        let mut g = group(vec![issue(1, IssueType::Bug)]);
        g.branch = "feature/login".into();
        assert!(g.validate().is_err());
        g.branch = "fix/Login".into();
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_accepts_convention() {
        let g = group(vec![issue(12, IssueType::Bug), issue(14, IssueType::Bug)]);
        assert_eq!(g.branch, "fix/login-timeout-12-14");
        g.validate().unwrap();
    }

    #[test]
    fn commit_subject_lists_numbers() {
        let g = group(vec![issue(12, IssueType::Bug), issue(14, IssueType::Bug)]);
        assert_eq!(g.commit_subject(), "fix: login timeout (#12, #14)");
    }

    #[test]
    fn review_body_closes_each_issue() {
        let g = group(vec![issue(7, IssueType::Bug)]);
        let body = g.review_request_body();
        assert!(body.contains("Closes #7"));
    }

    #[test]
    fn priority_orders_highest_first() {
        assert!(IssuePriority::Critical < IssuePriority::Low);
        let highest = [IssuePriority::Low, IssuePriority::High]
            .into_iter()
            .min()
            .unwrap();
        assert_eq!(highest, IssuePriority::High);
    }
}
