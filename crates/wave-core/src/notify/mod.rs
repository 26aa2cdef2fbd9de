//! Slack webhook notifications.
//!
//! A thin, failure-tolerant notifier: disabled when `SLACK_ENABLED` is
//! off or no webhook URL is configured, and a send failure is logged,
//! never propagated. Budget alerts carry a dedicated channel tag and
//! safety violations go out as critical alerts.

use std::env;
use std::time::Duration;

use serde::Serialize;

/// Message severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn emoji(self) -> &'static str {
        match self {
            Self::Info => ":information_source:",
            Self::Warning => ":warning:",
            Self::Critical => ":rotating_light:",
        }
    }
}

/// Slack webhook notifier.
pub struct SlackNotifier {
    webhook_url: String,
    enabled: bool,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Build from the environment: `SLACK_WEBHOOK_URL` and
    /// `SLACK_ENABLED`.
    pub fn from_env() -> Self {
        let webhook_url = env::var("SLACK_WEBHOOK_URL").unwrap_or_default();
        let enabled = env::var("SLACK_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self::new(webhook_url, enabled)
    }

    pub fn new(webhook_url: impl Into<String>, enabled: bool) -> Self {
        let webhook_url = webhook_url.into();
        Self {
            enabled: enabled && !webhook_url.is_empty(),
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Send raw text to the webhook.
    ///
    /// Returns whether the message was delivered. Network failures are
    /// logged and reported as `false`; notifications never take down a
    /// workflow.
    pub async fn send(&self, text: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let payload = serde_json::json!({ "text": text });
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "slack webhook rejected message");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "slack webhook send failed");
                false
            }
        }
    }

    /// Notify a workflow step.
    pub async fn notify_step(
        &self,
        agent: &str,
        action: &str,
        run_id: &str,
        severity: Severity,
    ) -> bool {
        self.send(&format!(
            "{} *[{run_id}]* `{agent}` {action}",
            severity.emoji()
        ))
        .await
    }

    /// Notify a run starting.
    pub async fn notify_run_start(&self, run_id: &str, task: &str) -> bool {
        self.send(&format!(
            ":rocket: *[{run_id}]* workflow started: {task}"
        ))
        .await
    }

    /// Notify a run finishing with its final status.
    pub async fn notify_run_complete(&self, run_id: &str, status: &str, stories: usize) -> bool {
        self.send(&format!(
            ":checkered_flag: *[{run_id}]* workflow {status} ({stories} stories)"
        ))
        .await
    }

    /// Budget alerts go to the budget channel tag.
    pub async fn notify_budget_alert(&self, run_id: &str, level: &str, percent: f64) -> bool {
        self.send(&format!(
            "{} *[{run_id}]* #budget {level}: {percent:.0}% of budget used",
            Severity::Warning.emoji()
        ))
        .await
    }

    /// Safety violations are critical alerts.
    pub async fn notify_safety_alert(&self, run_id: &str, violations: &[String]) -> bool {
        self.send(&format!(
            "{} *[{run_id}]* #alerts safety violation: {}",
            Severity::Critical.emoji(),
            violations.join("; ")
        ))
        .await
    }
}
