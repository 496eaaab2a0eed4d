//! File-backed durability for the virtmon alert engine.
//!
//! Rules, active alerts, acknowledgements, notification delivery status and
//! custom thresholds are each persisted as a full-file JSON rewrite on every
//! mutation. Persistence is fire-and-forget: callers log failures and keep
//! serving from memory until the next successful write.

pub mod error;
pub mod store;
pub mod watch;


pub use error::{Result, StorageError};
pub use store::{load_document, save_document, DurableStore, FileStore, MemoryStore};
pub use watch::{FileWatcher, WatcherHandle};

/// Names of the engine's persisted documents.
pub mod files {
    pub const ALERT_RULES: &str = "alert-rules.json";
    pub const ACTIVE_ALERTS: &str = "active-alerts.json";
    pub const ACKNOWLEDGEMENTS: &str = "acknowledgements.json";
    pub const NOTIFICATION_HISTORY: &str = "notification-history.json";
    pub const CUSTOM_THRESHOLDS: &str = "custom-thresholds.json";
}
