//! Periodic background pulls.

use crate::error::SyncError;
use crate::fs::FileSystem;
use crate::manager::SyncManager;
use crate::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Interval configured in `settings`, if auto-sync is enabled.
pub fn interval_from_settings(settings: &Settings) -> Option<Duration> {
    settings
        .auto_sync_interval_minutes
        .filter(|minutes| *minutes > 0)
        .map(|minutes| Duration::from_secs(minutes * 60))
}

/// Running auto-sync task. Dropping the handle stops it.
pub struct AutoSyncHandle {
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Pull every `every`, starting immediately.
///
/// A tick that finds a pass already running does nothing; ticks are never
/// queued behind a running pass.
pub fn spawn_auto_sync<F>(manager: Arc<SyncManager<F>>, every: Duration) -> AutoSyncHandle
where
    F: FileSystem + 'static,
{
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = every.as_secs(), "Auto-sync started");

        loop {
            ticker.tick().await;
            if manager.is_syncing() {
                debug!("Auto-sync tick skipped, sync in progress");
                continue;
            }
            match manager.sync_from_server(false).await {
                Ok(summary) => info!(%summary, "Auto-sync pass complete"),
                Err(SyncError::AlreadyRunning) => debug!("Auto-sync tick skipped, sync in progress"),
                Err(e) => warn!(error = %e, "Auto-sync pass failed"),
            }
        }
    });

    AutoSyncHandle { task }
}
