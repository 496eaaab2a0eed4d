use crate::error::NotifyError;
use crate::NotificationChannel;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use virtmon_common::types::{Alert, EngineEvent};
use virtmon_storage::{files, save_document, DurableStore};

/// Delivery record for one alert. An alert is notified at most once per
/// channel; escalation raises urgency on channels that have not fired yet
/// but never repeats a delivered one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationStatus {
    #[serde(default)]
    pub email_sent: bool,
    #[serde(default)]
    pub webhook_sent: bool,
    /// Channel name with the delivery timestamp, for operators.
    #[serde(default)]
    pub channels: HashMap<String, String>,
}

impl NotificationStatus {
    fn already_sent(&self, channel: &str) -> bool {
        match channel {
            "email" => self.email_sent,
            "webhook" => self.webhook_sent,
            _ => self.channels.contains_key(channel),
        }
    }

    fn mark_sent(&mut self, channel: &str) {
        match channel {
            "email" => self.email_sent = true,
            "webhook" => self.webhook_sent = true,
            _ => {}
        }
        self.channels
            .insert(channel.to_string(), Utc::now().to_rfc3339());
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Master switch for email delivery; per-rule flags gate further.
    pub email_enabled: bool,
    pub webhook_enabled: bool,
    /// Upper bound on a single channel send, in seconds.
    pub send_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            email_enabled: false,
            webhook_enabled: false,
            send_timeout_secs: 10,
        }
    }
}

struct Inner {
    store: Arc<dyn DurableStore>,
    email: Option<Box<dyn NotificationChannel>>,
    webhook: Option<Box<dyn NotificationChannel>>,
    email_enabled: bool,
    webhook_enabled: bool,
    send_timeout: Duration,
    status: Mutex<HashMap<String, NotificationStatus>>,
    events: broadcast::Sender<EngineEvent>,
}

/// Fans an alert out to the configured channels. Cheap to clone, all
/// state lives behind the shared inner.
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn DurableStore>,
        config: DispatcherConfig,
        email: Option<Box<dyn NotificationChannel>>,
        webhook: Option<Box<dyn NotificationChannel>>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let status: HashMap<String, NotificationStatus> =
            match virtmon_storage::load_document(store.as_ref(), files::NOTIFICATION_HISTORY) {
                Ok(Some(map)) => map,
                Ok(None) => HashMap::new(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load notification history, starting fresh");
                    HashMap::new()
                }
            };

        Self {
            inner: Arc::new(Inner {
                store,
                email,
                webhook,
                email_enabled: config.email_enabled,
                webhook_enabled: config.webhook_enabled,
                send_timeout: Duration::from_secs(config.send_timeout_secs),
                status: Mutex::new(status),
                events,
            }),
        }
    }

    pub fn status_of(&self, alert_id: &str) -> Option<NotificationStatus> {
        match self.inner.status.lock() {
            Ok(map) => map.get(alert_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(alert_id).cloned(),
        }
    }

    /// Drop delivery records for alerts no longer tracked by the engine.
    pub fn retain_alerts(&self, keep: &dyn Fn(&str) -> bool) {
        let mut map = match self.inner.status.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.retain(|id, _| keep(id));
        if let Err(e) =
            save_document(self.inner.store.as_ref(), files::NOTIFICATION_HISTORY, &*map)
        {
            tracing::error!(error = %e, "Failed to persist notification history");
        }
    }

    /// Deliver an alert on every enabled channel it has not reached yet.
    pub async fn send_notifications(&self, alert: &Alert, urgent: bool) {
        let inner = &self.inner;

        let email_due = inner.email_enabled && alert.rule.send_email;
        let webhook_due = inner.webhook_enabled && alert.rule.send_webhook;

        if email_due {
            if let Some(channel) = &inner.email {
                self.deliver(channel.as_ref(), alert, urgent).await;
            } else {
                tracing::warn!(alert_id = %alert.id, "Email enabled but no channel configured");
            }
        }
        if webhook_due {
            if let Some(channel) = &inner.webhook {
                self.deliver(channel.as_ref(), alert, urgent).await;
            } else {
                tracing::warn!(alert_id = %alert.id, "Webhook enabled but no channel configured");
            }
        }
    }

    async fn deliver(&self, channel: &dyn NotificationChannel, alert: &Alert, urgent: bool) {
        let name = channel.channel_name();
        if self.is_sent(&alert.id, name) {
            tracing::debug!(alert_id = %alert.id, channel = name, "Already notified, skipping");
            return;
        }

        let outcome = tokio::time::timeout(self.inner.send_timeout, channel.send(alert, urgent))
            .await
            .map_err(|_| NotifyError::Timeout { channel: name })
            .and_then(|r| r);

        match outcome {
            Ok(()) => {
                tracing::info!(
                    alert_id = %alert.id,
                    channel = name,
                    rule = %alert.rule.name,
                    urgent = urgent,
                    "Notification delivered"
                );
                self.record_sent(&alert.id, name);
                let _ = self.inner.events.send(EngineEvent::Notification {
                    alert_id: alert.id.clone(),
                    channel: name.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(
                    alert_id = %alert.id,
                    channel = name,
                    error = %e,
                    "Notification failed"
                );
                let _ = self.inner.events.send(EngineEvent::NotificationError {
                    alert_id: alert.id.clone(),
                    channel: name.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn is_sent(&self, alert_id: &str, channel: &str) -> bool {
        let map = match self.inner.status.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(alert_id)
            .map(|s| s.already_sent(channel))
            .unwrap_or(false)
    }

    fn record_sent(&self, alert_id: &str, channel: &str) {
        let mut map = match self.inner.status.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(alert_id.to_string())
            .or_default()
            .mark_sent(channel);
        if let Err(e) =
            save_document(self.inner.store.as_ref(), files::NOTIFICATION_HISTORY, &*map)
        {
            tracing::error!(error = %e, "Failed to persist notification history");
        }
    }
}

impl virtmon_alert::Notifier for NotificationDispatcher {
    fn dispatch(&self, alert: Alert, urgent: bool) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.send_notifications(&alert, urgent).await;
        });
    }

    fn prune(&self, live: &HashSet<String>) {
        self.retain_alerts(&|id| live.contains(id));
    }
}
