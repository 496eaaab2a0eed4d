//! Notification delivery for virtmon alerts.
//!
//! The [`dispatcher::NotificationDispatcher`] fans an alert out to the
//! configured [`NotificationChannel`]s (SMTP email, webhook) on a detached
//! task, with its own timeout and retries, so delivery never blocks the
//! evaluation tick. Delivery status is deduplicated per alert and channel
//! and persisted to `notification-history.json`.

pub mod channels;
pub mod dispatcher;
pub mod error;


pub use dispatcher::{DispatcherConfig, NotificationDispatcher, NotificationStatus};
pub use error::{NotifyError, Result};

use async_trait::async_trait;
use virtmon_common::types::Alert;

/// A notification delivery channel that sends alerts to an external service.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers the alert through this channel.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails after retries (if applicable).
    async fn send(&self, alert: &Alert, urgent: bool) -> Result<()>;

    /// Returns the channel name (`"email"` or `"webhook"`).
    fn channel_name(&self) -> &'static str;
}
