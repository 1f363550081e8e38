use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::WatchCallback;
use crate::core::error::{GateError, Result};

/// Timestamp-polling file watcher.
///
/// Native change notifications are not used. Every `interval` the file's
/// modification time is compared to the last observed one and the callback
/// fires once per difference, including the file appearing or disappearing.
/// There is no debouncing.
pub struct PollWatcher {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollWatcher {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    /// Starts polling `path`, replacing any watch already running.
    pub fn start(&self, path: PathBuf, interval: Duration, callback: WatchCallback) -> Result<()> {
        if interval.is_zero() {
            return Err(GateError::WatchRegistration(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GateError::WatchRegistration(e.to_string()))?;

        let initial = modified_time(&path);
        debug!(path = %path.display(), ?interval, "Starting permission file poll");

        let task = runtime.spawn(poll_loop(path, interval, initial, callback));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Stopped permission file poll");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Default for PollWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn poll_loop(
    path: PathBuf,
    period: Duration,
    mut last_seen: Option<SystemTime>,
    callback: WatchCallback,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick resolves immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let current = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .ok();

        if current != last_seen {
            debug!(
                path = %path.display(),
                existed = last_seen.is_some(),
                exists = current.is_some(),
                "Permission file modification detected"
            );
            last_seen = current;
            callback();
        }
    }
}
