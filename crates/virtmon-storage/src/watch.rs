use crate::store::mtime_of;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Polls a file's mtime and sends a unit message whenever it changes.
///
/// Used to pick up out-of-band edits to the rule file. Polling (rather than
/// inotify) keeps behaviour identical across platforms and network mounts.
pub struct FileWatcher {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    /// Spawn the polling task. Change notifications arrive on the returned
    /// receiver; drop the handle (or call [`WatcherHandle::stop`]) to stop
    /// the watcher.
    pub fn spawn(self) -> (mpsc::Receiver<()>, WatcherHandle) {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            let mut last: Option<SystemTime> = mtime_of(&self.path);
            let mut tick = interval(self.poll_interval);
            loop {
                tick.tick().await;
                let current = mtime_of(&self.path);
                if current != last {
                    tracing::info!(path = %self.path.display(), "Watched file changed");
                    last = current;
                    // Receiver lagging is fine; a queued notification already
                    // implies a reload.
                    let _ = tx.try_send(());
                }
            }
        });
        (rx, WatcherHandle(handle))
    }
}

/// Stops the watcher task when dropped.
pub struct WatcherHandle(JoinHandle<()>);

impl WatcherHandle {
    pub fn stop(&self) {
        self.0.abort();
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
