use crate::sync::{LoadOutcome, Synchronizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Keeps the inbox current while alive: refreshes on a fixed interval and
/// whenever the terminal regains focus. Dropping it stops the task.
pub struct AutoRefresh {
    focus: Arc<Notify>,
    task: JoinHandle<()>,
}

impl AutoRefresh {
    pub fn start(sync: Synchronizer, interval: Duration) -> Self {
        let focus = Arc::new(Notify::new());
        let wake = focus.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => debug!("periodic refresh"),
                    _ = wake.notified() => debug!("refresh on focus"),
                }
                match sync.background_refresh().await {
                    Ok(LoadOutcome::Loaded { arrived, removed }) => {
                        debug!("inbox refreshed: {} new, {} removed", arrived, removed)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("background refresh failed: {}", e),
                }
            }
        });
        Self { focus, task }
    }

    pub fn focus_gained(&self) {
        self.focus.notify_one();
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.task.abort();
    }
}
