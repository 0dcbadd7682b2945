//! Aggregated run reporting.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::pipeline::{PipelineResult, PipelineStatus};

/// Per-group line in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportItem {
    pub group_id: String,
    pub group_name: String,
    pub status: PipelineStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub pull_request_number: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Summary of a whole queue run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub processed: usize,
    /// Review requests opened.
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failures that need a human: permanent error codes.
    pub needs_info: usize,
    pub items: Vec<ReportItem>,
}

impl RunReport {
    pub fn from_results(results: &[PipelineResult]) -> Self {
        let mut report = Self {
            processed: results.len(),
            created: 0,
            skipped: 0,
            failed: 0,
            needs_info: 0,
            items: Vec::with_capacity(results.len()),
        };

        for result in results {
            match result.status {
                PipelineStatus::Completed if result.pull_request.is_some() => report.created += 1,
                PipelineStatus::Completed => {}
                PipelineStatus::Skipped => report.skipped += 1,
                PipelineStatus::Failed => {
                    report.failed += 1;
                    let permanent = result.error.as_ref().is_some_and(|e| {
                        !e.is_retryable() || e.code == ErrorCode::Unknown
                    });
                    if permanent {
                        report.needs_info += 1;
                    }
                }
            }

            report.items.push(ReportItem {
                group_id: result.group.id.clone(),
                group_name: result.group.name.clone(),
                status: result.status,
                attempts: result.attempts,
                duration_ms: result.duration_ms,
                pull_request_number: result.pull_request.as_ref().map(|pr| pr.number),
                error: result.error_summary.clone(),
            });
        }
        report
    }

    /// Human-readable rendering for the CLI.
    pub fn render(&self) -> String {
        let mut out = format!(
            "processed {} group(s): {} created, {} failed, {} skipped, {} need attention\n",
            self.processed, self.created, self.failed, self.skipped, self.needs_info
        );
        for item in &self.items {
            let status = match item.status {
                PipelineStatus::Completed => "ok",
                PipelineStatus::Failed => "FAILED",
                PipelineStatus::Skipped => "skipped",
            };
            out.push_str(&format!(
                "  [{status}] {} ({} attempt(s), {} ms)",
                item.group_name, item.attempts, item.duration_ms
            ));
            if let Some(pr) = item.pull_request_number {
                out.push_str(&format!(" -> PR #{pr}"));
            }
            if let Some(error) = &item.error {
                out.push_str(&format!(" -- {error}"));
            }
            out.push('\n');
        }
        out
    }
}
