use crate::escalation::SchedulerHandle;
use crate::evaluator::AlertEvaluator;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use virtmon_storage::FileWatcher;

/// Reloads the rule set when the rule file changes on disk.
///
/// Out-of-band edits (an operator hand-editing `alert-rules.json`) flow
/// through the same guarded reload as API mutations: the new rule set is
/// immediately re-evaluated against the last seen metrics snapshot, so a
/// freshly enabled rule surfaces without waiting for the next scrape.
pub struct RuleWatchScheduler {
    evaluator: Arc<Mutex<AlertEvaluator>>,
    path: PathBuf,
    poll_interval: Duration,
}

impl RuleWatchScheduler {
    pub fn new(
        evaluator: Arc<Mutex<AlertEvaluator>>,
        path: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            evaluator,
            path: path.into(),
            poll_interval,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (mut changes, watcher) = FileWatcher::new(self.path.clone(), self.poll_interval).spawn();
        let handle = tokio::spawn(async move {
            // The watcher task lives exactly as long as this one.
            let _watcher = watcher;
            tracing::info!(path = %self.path.display(), "Rule watcher started");
            while changes.recv().await.is_some() {
                match self.evaluator.lock() {
                    Ok(mut evaluator) => evaluator.reload_rules(),
                    Err(_) => {
                        tracing::error!("Evaluator lock poisoned, skipping rule reload");
                    }
                }
            }
        });
        SchedulerHandle(handle)
    }
}
