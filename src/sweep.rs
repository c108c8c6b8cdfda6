//! Momentum alert sweep.
//!
//! One sweep holds the `alert_sweep` batch lock, walks the watchlist,
//! and turns transitions into the hot state into `momentum_alert`
//! notification rows. Baselines are updated on every observation so the
//! next sweep sees transitions, not levels.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::platform::{PlatformError, StartupDirectory, WatchlistDirectory};
use crate::store::{
    AlertStore, BatchLockStore, NewNotification, NotificationKind, Signal, StoreError,
};

pub const ALERT_SWEEP_LOCK: &str = "alert_sweep";

/// Momentum at or above this is the hot state.
pub const HOT_MOMENTUM_THRESHOLD: f64 = 75.0;

/// A user is alerted about one startup at most once per this window.
pub const ALERT_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// How one batch run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Another holder has the batch lock; nothing was evaluated.
    Skipped,
    Completed { notifications: usize },
}

pub struct AlertSweep<S> {
    store: Arc<S>,
    watchlists: Arc<dyn WatchlistDirectory>,
    startups: Arc<dyn StartupDirectory>,
    holder: String,
    lock_stale_after: Duration,
}

impl<S: AlertStore + BatchLockStore> AlertSweep<S> {
    pub fn new(
        store: Arc<S>,
        watchlists: Arc<dyn WatchlistDirectory>,
        startups: Arc<dyn StartupDirectory>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            watchlists,
            startups,
            holder: config.worker_id.clone(),
            lock_stale_after: Duration::from_secs(config.batch_lock_stale_seconds),
        }
    }

    /// Run one sweep, or skip entirely when another sweep holds the lock.
    pub async fn run(&self) -> Result<SweepOutcome, SweepError> {
        let acquired = self
            .store
            .try_acquire_batch_lock(ALERT_SWEEP_LOCK, &self.holder, self.lock_stale_after)
            .await?;
        if !acquired {
            debug!(holder = %self.holder, "alert sweep lock contended; skipping");
            return Ok(SweepOutcome::Skipped);
        }

        let result = self.sweep_watchlist().await;
        // Released on every exit path, error included.
        let released = self
            .store
            .release_batch_lock(ALERT_SWEEP_LOCK, &self.holder)
            .await;
        let notifications = result?;
        released?;
        Ok(SweepOutcome::Completed { notifications })
    }

    async fn sweep_watchlist(&self) -> Result<usize, SweepError> {
        let watched = self.watchlists.watched_startups().await?;
        let mut created = 0usize;

        for entry in watched {
            let Some(startup) = self.startups.startup(entry.startup_id).await? else {
                warn!(startup_id = %entry.startup_id, "watched startup missing from directory");
                continue;
            };
            let Some(current) = startup.momentum else {
                continue;
            };

            let baseline = self
                .store
                .signal_baseline(entry.startup_id, Signal::Momentum)
                .await?;
            let entering_hot = current >= HOT_MOMENTUM_THRESHOLD
                && baseline.is_none_or(|previous| previous < HOT_MOMENTUM_THRESHOLD);

            if entering_hot {
                info!(
                    startup_id = %entry.startup_id,
                    momentum = current,
                    "startup entered hot state"
                );
                for watcher in &entry.watcher_ids {
                    let now = Utc::now();
                    let last = self
                        .store
                        .last_alert_at(*watcher, NotificationKind::MomentumAlert, entry.startup_id)
                        .await?;
                    let cooled = last.is_none_or(|at| {
                        now - at >= chrono::Duration::hours(ALERT_COOLDOWN_HOURS)
                    });
                    if !cooled {
                        continue;
                    }

                    self.store
                        .insert_notification(NewNotification {
                            user_id: *watcher,
                            startup_id: Some(entry.startup_id),
                            kind: NotificationKind::MomentumAlert,
                            payload: json!({
                                "startup_id": entry.startup_id,
                                "startup_name": startup.name.as_str(),
                                "momentum": current,
                            }),
                        })
                        .await?;
                    self.store
                        .record_alert(*watcher, NotificationKind::MomentumAlert, entry.startup_id, now)
                        .await?;
                    counter!("belay_alerts_created_total").increment(1);
                    created += 1;
                }
            }

            // Record the observation whether or not anything fired.
            self.store
                .upsert_signal_baseline(entry.startup_id, Signal::Momentum, current)
                .await?;
        }

        Ok(created)
    }
}
