use crate::evaluator::AlertEvaluator;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Periodic sweep promoting stale unacknowledged alerts to urgent.
pub struct EscalationScheduler {
    evaluator: Arc<Mutex<AlertEvaluator>>,
    tick_secs: u64,
}

impl EscalationScheduler {
    pub fn new(evaluator: Arc<Mutex<AlertEvaluator>>, tick_secs: u64) -> Self {
        Self {
            evaluator,
            tick_secs,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let handle = tokio::spawn(async move {
            tracing::info!(tick_secs = self.tick_secs, "Escalation scheduler started");
            let mut tick = interval(Duration::from_secs(self.tick_secs));
            loop {
                tick.tick().await;
                let escalated = match self.evaluator.lock() {
                    Ok(mut evaluator) => evaluator.escalate_due(Utc::now()),
                    Err(poisoned) => {
                        tracing::error!("Evaluator lock poisoned, skipping escalation tick");
                        drop(poisoned);
                        continue;
                    }
                };
                if escalated > 0 {
                    tracing::info!(count = escalated, "Escalation sweep promoted alerts");
                }
            }
        });
        SchedulerHandle(handle)
    }
}

/// Periodic cleanup: drops stale resolved alerts, expires suppressions and
/// prunes metrics history.
pub struct CleanupScheduler {
    evaluator: Arc<Mutex<AlertEvaluator>>,
    tick_secs: u64,
}

impl CleanupScheduler {
    pub fn new(evaluator: Arc<Mutex<AlertEvaluator>>, tick_secs: u64) -> Self {
        Self {
            evaluator,
            tick_secs,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let handle = tokio::spawn(async move {
            tracing::info!(tick_secs = self.tick_secs, "Cleanup scheduler started");
            let mut tick = interval(Duration::from_secs(self.tick_secs));
            loop {
                tick.tick().await;
                match self.evaluator.lock() {
                    Ok(mut evaluator) => evaluator.cleanup(Utc::now()),
                    Err(poisoned) => {
                        tracing::error!("Evaluator lock poisoned, skipping cleanup tick");
                        drop(poisoned);
                    }
                }
            }
        });
        SchedulerHandle(handle)
    }
}

/// Stops the scheduler task when dropped; process shutdown stops all timers
/// by dropping the handles.
pub struct SchedulerHandle(pub(crate) JoinHandle<()>);

impl SchedulerHandle {
    pub fn stop(&self) {
        self.0.abort();
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
