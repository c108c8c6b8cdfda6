//! Digest sweep.
//!
//! Builds one `digest` notification per enrolled recipient whose digest
//! cooldown has elapsed and for whom the digest source has content.
//! Digest cooldowns reuse the alert cooldown table with the nil startup
//! id, since a digest is not about any single startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, info};

use crate::config::Config;
use crate::platform::{DigestSource, RecipientDirectory};
use crate::store::{AlertStore, BatchLockStore, NewNotification, NotificationKind, StartupId};
use crate::sweep::{SweepError, SweepOutcome};

pub const DIGEST_SWEEP_LOCK: &str = "digest_sweep";

/// A recipient gets at most one digest per this window.
pub const DIGEST_COOLDOWN_HOURS: i64 = 24;

pub struct DigestSweep<S> {
    store: Arc<S>,
    recipients: Arc<dyn RecipientDirectory>,
    source: Arc<dyn DigestSource>,
    holder: String,
    lock_stale_after: Duration,
}

impl<S: AlertStore + BatchLockStore> DigestSweep<S> {
    pub fn new(
        store: Arc<S>,
        recipients: Arc<dyn RecipientDirectory>,
        source: Arc<dyn DigestSource>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            recipients,
            source,
            holder: config.worker_id.clone(),
            lock_stale_after: Duration::from_secs(config.batch_lock_stale_seconds),
        }
    }

    pub async fn run(&self) -> Result<SweepOutcome, SweepError> {
        let acquired = self
            .store
            .try_acquire_batch_lock(DIGEST_SWEEP_LOCK, &self.holder, self.lock_stale_after)
            .await?;
        if !acquired {
            debug!(holder = %self.holder, "digest sweep lock contended; skipping");
            return Ok(SweepOutcome::Skipped);
        }

        let result = self.sweep_recipients().await;
        let released = self
            .store
            .release_batch_lock(DIGEST_SWEEP_LOCK, &self.holder)
            .await;
        let notifications = result?;
        released?;
        Ok(SweepOutcome::Completed { notifications })
    }

    async fn sweep_recipients(&self) -> Result<usize, SweepError> {
        let recipients = self.recipients.digest_recipients().await?;
        let mut created = 0usize;

        for recipient in recipients {
            if !recipient.subscribed {
                continue;
            }

            let now = Utc::now();
            let last = self
                .store
                .last_alert_at(recipient.user_id, NotificationKind::Digest, StartupId::nil())
                .await?;
            let cooled = last
                .is_none_or(|at| now - at >= chrono::Duration::hours(DIGEST_COOLDOWN_HOURS));
            if !cooled {
                continue;
            }

            // No content since the last digest means nothing to send; the
            // cooldown is left untouched so the next sweep asks again.
            let Some(content) = self.source.digest_content(recipient.user_id, last).await? else {
                continue;
            };

            self.store
                .insert_notification(NewNotification {
                    user_id: recipient.user_id,
                    startup_id: None,
                    kind: NotificationKind::Digest,
                    payload: content,
                })
                .await?;
            self.store
                .record_alert(recipient.user_id, NotificationKind::Digest, StartupId::nil(), now)
                .await?;
            counter!("belay_digests_created_total").increment(1);
            info!(user_id = %recipient.user_id, "digest queued");
            created += 1;
        }

        Ok(created)
    }
}
