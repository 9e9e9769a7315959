//! Failure notifications -- webhook delivery with a rendered HTML summary.

use anyhow::Result;
use askama::Template;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::model::{ExecutionRecord, Report};

#[derive(Template)]
#[template(path = "report_notice.html")]
struct ReportNoticeTemplate<'a> {
    task_name: &'a str,
    total: usize,
    passed: usize,
    failed: usize,
}

/// A notification payload: short title plus rendered content.
#[derive(Debug, Clone)]
pub struct Notice {
    pub title: String,
    pub content: String,
}

impl Notice {
    /// Build the failure notice for a completed run.
    pub fn for_failed_run(task_name: &str, report: &Report) -> Self {
        let total = report.test_list.len();
        let failed = report
            .test_list
            .iter()
            .filter(|r| r.code != ExecutionRecord::CODE_PASSED)
            .count();
        let passed = total - failed;

        let content = ReportNoticeTemplate {
            task_name,
            total,
            passed,
            failed,
        }
        .render()
        .unwrap_or_else(|_| {
            format!(
                "Scheduled task [{}] finished: {} of {} cases failed.",
                task_name, failed, total
            )
        });

        Self {
            title: format!("Scheduled test failed: {}", task_name),
            content,
        }
    }
}

/// Notification collaborator. Fire-and-forget: failures are logged by the
/// caller, never escalated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, project_id: i64, notice: &Notice) -> Result<()>;
}

/// POSTs notices as JSON to a configured webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, project_id: i64, notice: &Notice) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "project_id": project_id,
                "title": notice.title,
                "content": notice.content,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Fallback notifier when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, project_id: i64, notice: &Notice) -> Result<()> {
        info!(project = project_id, title = %notice.title, "test failure notice");
        Ok(())
    }
}
