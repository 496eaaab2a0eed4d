use crate::error::{NotifyError, Result};
use crate::NotificationChannel;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use virtmon_common::types::Alert;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Payload format picked from the target URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Slack,
    Discord,
    Generic,
}

impl PayloadShape {
    pub fn detect(url: &str) -> Self {
        if url.contains("hooks.slack.com") {
            PayloadShape::Slack
        } else if url.contains("discord.com/api/webhooks") || url.contains("discordapp.com") {
            PayloadShape::Discord
        } else {
            PayloadShape::Generic
        }
    }
}

pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    shape: PayloadShape,
}

impl WebhookChannel {
    pub fn new(url: &str) -> Result<Self> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(NotifyError::InvalidConfig(format!(
                "webhook url must be http(s): {url}"
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            shape: PayloadShape::detect(url),
        })
    }

    pub fn payload(&self, alert: &Alert, urgent: bool) -> Value {
        let headline = headline(alert, urgent);
        match self.shape {
            PayloadShape::Slack => json!({
                "text": headline,
                "blocks": [{
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": detail_markdown(alert) }
                }]
            }),
            PayloadShape::Discord => json!({
                "content": headline,
                "embeds": [{
                    "title": alert.rule.name,
                    "description": detail_markdown(alert),
                    "color": if urgent { 0xC0392B } else { 0xE67E22 },
                }]
            }),
            PayloadShape::Generic => json!({
                "text": headline,
                "alert_id": alert.id,
                "rule": alert.rule.name,
                "guest": alert.guest.name,
                "node": alert.guest.node,
                "vmid": alert.guest.vmid,
                "state": alert.state.to_string(),
                "value": alert.current_value,
                "threshold": alert.effective_threshold,
                "escalated": urgent,
                "start_time": alert.start_time,
            }),
        }
    }
}

fn headline(alert: &Alert, urgent: bool) -> String {
    let tag = if urgent { " [ESCALATED]" } else { "" };
    format!(
        "virtmon alert{tag}: {} on {} (vmid {}) - {} (threshold {})",
        alert.rule.name,
        alert.guest.name,
        alert.guest.vmid,
        alert.current_value,
        alert.effective_threshold,
    )
}

fn detail_markdown(alert: &Alert) -> String {
    format!(
        "*Guest*: {} (vmid {}) on {}\n*State*: {}\n*Value*: {}\n*Threshold*: {}\n*Since*: {}",
        alert.guest.name,
        alert.guest.vmid,
        alert.guest.node,
        alert.state,
        alert.current_value,
        alert.effective_threshold,
        alert.start_time,
    )
}

/// 4xx responses will not change on retry.
pub fn is_permanent_status(status: u16) -> bool {
    (400..500).contains(&status)
}

/// Exponential backoff: 1s, 2s, 4s, capped at 5s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << (attempt.saturating_sub(1)).min(6);
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, alert: &Alert, urgent: bool) -> Result<()> {
        let payload = self.payload(alert, urgent);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.post(&self.url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        tracing::debug!(alert_id = %alert.id, url = %self.url, "Webhook delivered");
                        return Ok(());
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if is_permanent_status(status.as_u16()) {
                        return Err(NotifyError::Api {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    last_error = format!("HTTP {status}: {body}");
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                tracing::warn!(
                    alert_id = %alert.id,
                    attempt = attempt,
                    error = %last_error,
                    "Webhook delivery failed, retrying"
                );
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        Err(NotifyError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            last: last_error,
        })
    }

    fn channel_name(&self) -> &'static str {
        "webhook"
    }
}
