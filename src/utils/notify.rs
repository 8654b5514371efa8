use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::NotificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    BackupCompleted,
    BackupFailed,
    RestoreCompleted,
    RestoreFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub job: String,
    pub subject: String,
    pub message: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Default notifier: writes the event to the log only.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            event = ?notification.event,
            job = %notification.job,
            "{}: {}",
            notification.subject,
            notification.message
        );
        Ok(())
    }
}

/// Posts each notification as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.http
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .with_context(|| format!("Failed to deliver notification to {}", self.url))?
            .error_for_status()
            .context("Notification webhook rejected the request")?;
        Ok(())
    }
}

pub fn notifier_from_config(config: &NotificationConfig, http: reqwest::Client) -> Arc<dyn Notifier> {
    match (&config.webhook_url, config.enabled) {
        (Some(url), true) => Arc::new(WebhookNotifier::new(http, url.clone())),
        _ => Arc::new(TracingNotifier),
    }
}

/// Sends a notification; delivery failures are logged, never propagated.
pub async fn send_notification(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification).await {
        warn!(job = %notification.job, "Notification delivery failed: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_webhook_posts_event_json() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "event": "backup_failed",
                "job": "backup_7"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = NotificationConfig {
            enabled: true,
            webhook_url: Some(format!("{}/hook", server.uri())),
        };
        let notifier = notifier_from_config(&config, reqwest::Client::new());
        notifier
            .notify(&Notification {
                event: NotificationEvent::BackupFailed,
                job: "backup_7".into(),
                subject: "Backup failed".into(),
                message: "disk full".into(),
            })
            .await?;
        Ok(())
    }
}
