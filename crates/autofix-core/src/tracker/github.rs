//! GitHub REST v3 implementation of the tracker capability.

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{IssueState, IssueTracker, IssueUpdate, ReviewRequest, ReviewRequestSpec, TrackerError};
use crate::config::GitHubConfig;

const USER_AGENT: &str = concat!("autofix/", env!("CARGO_PKG_VERSION"));

pub struct GitHubTracker {
    http: Client,
    api_base: String,
    owner: String,
    repo: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

impl GitHubTracker {
    pub fn new(cfg: &GitHubConfig, token: String) -> Result<Self, TrackerError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TrackerError::Network(e.to_string()))?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            owner: cfg.owner.clone(),
            repo: cfg.repo.clone(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.owner, self.repo, path
        );
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<(StatusCode, String), TrackerError> {
        let response = builder
            .send()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TrackerError::Network(e.to_string()))?;
        Ok((status, body))
    }

    async fn expect_success(
        &self,
        builder: RequestBuilder,
    ) -> Result<(StatusCode, String), TrackerError> {
        let (status, body) = self.send(builder).await?;
        if status.is_success() {
            Ok((status, body))
        } else {
            Err(TrackerError::from_status(status.as_u16(), &body))
        }
    }
}

impl IssueTracker for GitHubTracker {
    async fn create_review_request(
        &self,
        spec: &ReviewRequestSpec,
    ) -> Result<ReviewRequest, TrackerError> {
        debug!(head = %spec.head, base = %spec.base, "creating pull request");

        let (_, body) = self
            .expect_success(self.request(Method::POST, "pulls").json(&json!({
                "title": spec.title,
                "body": spec.body,
                "head": spec.head,
                "base": spec.base,
                "draft": spec.draft,
            })))
            .await?;

        let pull: PullResponse = serde_json::from_str(&body)
            .map_err(|e| TrackerError::Validation(format!("unexpected pulls response: {e}")))?;
        let pr = ReviewRequest {
            number: pull.number,
            url: pull.html_url,
        };

        if !spec.labels.is_empty() {
            // Pull requests are issues for labelling purposes.
            self.expect_success(
                self.request(Method::POST, &format!("issues/{}/labels", pr.number))
                    .json(&json!({ "labels": spec.labels })),
            )
            .await?;
        }

        if !spec.reviewers.is_empty() {
            // Reviewer assignment is best-effort: a missing reviewer must
            // not fail the opened request.
            let result = self
                .expect_success(
                    self.request(
                        Method::POST,
                        &format!("pulls/{}/requested_reviewers", pr.number),
                    )
                    .json(&json!({ "reviewers": spec.reviewers })),
                )
                .await;
            if let Err(e) = result {
                warn!(error = %e, "reviewer assignment failed");
            }
        }

        Ok(pr)
    }

    async fn update_issue(&self, number: u64, update: &IssueUpdate) -> Result<(), TrackerError> {
        if update.state.is_some() || !update.assignees.is_empty() {
            let mut patch = serde_json::Map::new();
            if let Some(state) = update.state {
                let value = match state {
                    IssueState::Open => "open",
                    IssueState::Closed => "closed",
                };
                patch.insert("state".into(), json!(value));
            }
            if !update.assignees.is_empty() {
                patch.insert("assignees".into(), json!(update.assignees));
            }
            self.expect_success(
                self.request(Method::PATCH, &format!("issues/{number}"))
                    .json(&serde_json::Value::Object(patch)),
            )
            .await?;
        }

        if !update.add_labels.is_empty() {
            self.expect_success(
                self.request(Method::POST, &format!("issues/{number}/labels"))
                    .json(&json!({ "labels": update.add_labels })),
            )
            .await?;
        }

        for label in &update.remove_labels {
            let (status, body) = self
                .send(self.request(
                    Method::DELETE,
                    &format!("issues/{number}/labels/{label}"),
                ))
                .await?;
            // Removing a label the issue never had is fine.
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                return Err(TrackerError::from_status(status.as_u16(), &body));
            }
        }

        if let Some(comment) = &update.comment {
            self.expect_success(
                self.request(Method::POST, &format!("issues/{number}/comments"))
                    .json(&json!({ "body": comment })),
            )
            .await?;
        }

        Ok(())
    }
}
