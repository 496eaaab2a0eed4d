//! Alert evaluation engine for virtualization guests.
//!
//! The engine consumes periodic metric snapshots, evaluates them against
//! configurable threshold rules (single-metric or compound), and drives each
//! alert through the pending → active → resolved state machine. Escalation
//! and cleanup run on their own ticks, the rule file is watched for
//! out-of-band edits, and notification delivery is detached from the
//! evaluation path via the [`Notifier`] seam.

pub mod anomaly;
pub mod escalation;
pub mod evaluator;
pub mod history;
pub mod reload;
pub mod rules;
pub mod thresholds;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use virtmon_common::types::Alert;

/// Errors surfaced to callers of the engine's mutation APIs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A rule failed validation (malformed shape, missing fields, bad ranges).
    #[error("Engine: invalid rule: {0}")]
    InvalidRule(String),

    /// A custom threshold config failed validation.
    #[error("Engine: invalid threshold config: {0}")]
    InvalidThresholds(String),

    /// No rule with the given ID exists.
    #[error("Engine: unknown rule '{0}'")]
    UnknownRule(String),

    /// No alert with the given ID exists in the active set.
    #[error("Engine: unknown alert '{0}'")]
    UnknownAlert(String),

    /// An underlying persistence failure that cannot be absorbed.
    #[error(transparent)]
    Storage(#[from] virtmon_storage::StorageError),
}

/// Convenience `Result` alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Outbound seam to the notification dispatcher.
///
/// Implementations must return immediately: delivery, timeouts and retries
/// all happen on a detached task so they never block the next evaluation
/// tick.
pub trait Notifier: Send + Sync {
    fn dispatch(&self, alert: Alert, urgent: bool);

    /// Drop delivery bookkeeping for any alert not in `live`. Invoked by
    /// the cleanup sweep; implementations without per-alert state keep the
    /// no-op default.
    fn prune(&self, _live: &HashSet<String>) {}
}
