//! Notification delivery.
//!
//! Drains pending notifications through the outbound transport. A run
//! is guarded twice: the batch lock keeps concurrent processes off the
//! same backlog, and a per-row CAS claim keeps any single row from
//! being sent twice even if the lock is taken over as stale. Rows move
//! one way, `pending -> claiming -> {sent, skipped, failed}`.
//!
//! Consecutive provider failures trip a breaker that abandons the rest
//! of the batch. Each new run starts with the breaker clear, so a later
//! batch probes the provider again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::platform::{DeliveryTransport, RecipientDirectory};
use crate::store::{BatchLockStore, DeliveryStore, Notification, SkipReason, StoreResult};

pub const DELIVERY_RUN_LOCK: &str = "delivery_run";

/// The daily cap counts sends inside this rolling window.
pub const SEND_WINDOW_HOURS: i64 = 24;

/// What happened to each row a run touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    /// True when consecutive failures abandoned the rest of the batch.
    pub breaker_tripped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Another holder has the batch lock; nothing was touched.
    Skipped,
    Completed(DeliveryReport),
}

enum ItemOutcome {
    Sent,
    Skipped,
    Failed,
}

pub struct DeliveryEngine<S> {
    store: Arc<S>,
    recipients: Arc<dyn RecipientDirectory>,
    transport: Arc<dyn DeliveryTransport>,
    claimer: String,
    batch_size: i64,
    daily_cap: i64,
    breaker_threshold: u32,
    send_delay: Duration,
    lock_stale_after: Duration,
    consecutive_failures: AtomicU32,
}

impl<S: DeliveryStore + BatchLockStore> DeliveryEngine<S> {
    pub fn new(
        store: Arc<S>,
        recipients: Arc<dyn RecipientDirectory>,
        transport: Arc<dyn DeliveryTransport>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            recipients,
            transport,
            claimer: config.worker_id.clone(),
            batch_size: config.delivery_batch_size,
            daily_cap: config.daily_send_cap,
            breaker_threshold: config.breaker_threshold,
            send_delay: Duration::from_millis(config.send_delay_ms),
            lock_stale_after: Duration::from_secs(config.batch_lock_stale_seconds),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn run(&self) -> StoreResult<DeliveryOutcome> {
        let acquired = self
            .store
            .try_acquire_batch_lock(DELIVERY_RUN_LOCK, &self.claimer, self.lock_stale_after)
            .await?;
        if !acquired {
            debug!(claimer = %self.claimer, "delivery lock contended; skipping");
            return Ok(DeliveryOutcome::Skipped);
        }

        let result = self.deliver_pending().await;
        let released = self
            .store
            .release_batch_lock(DELIVERY_RUN_LOCK, &self.claimer)
            .await;
        let report = result?;
        released?;
        Ok(DeliveryOutcome::Completed(report))
    }

    async fn deliver_pending(&self) -> StoreResult<DeliveryReport> {
        // A new run always probes the provider, even right after a trip.
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let pending = self.store.pending_notifications(self.batch_size).await?;
        let mut report = DeliveryReport::default();

        for notification in pending {
            if self.consecutive_failures.load(Ordering::SeqCst) >= self.breaker_threshold {
                counter!("belay_breaker_trips_total").increment(1);
                warn!(
                    threshold = self.breaker_threshold,
                    "provider failing; abandoning the rest of the batch"
                );
                report.breaker_tripped = true;
                break;
            }

            let claimed = self
                .store
                .claim_notification(notification.id, &self.claimer)
                .await?;
            if !claimed {
                // Another deliverer got the row first.
                continue;
            }

            match self.deliver_one(&notification).await? {
                ItemOutcome::Sent => report.sent += 1,
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::Failed => report.failed += 1,
            }

            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
        }

        Ok(report)
    }

    /// Deliver one claimed row. Provider and recipient-lookup failures
    /// count toward the breaker; skips do not.
    async fn deliver_one(&self, notification: &Notification) -> StoreResult<ItemOutcome> {
        let recipient = match self.recipients.recipient(notification.user_id).await {
            Ok(Some(recipient)) => recipient,
            Ok(None) => {
                self.store
                    .mark_notification_skipped(
                        notification.id,
                        &self.claimer,
                        SkipReason::NoRecipient,
                    )
                    .await?;
                debug!(notification_id = %notification.id, "no recipient on file; skipped");
                return Ok(ItemOutcome::Skipped);
            }
            Err(error) => {
                self.store
                    .mark_notification_failed(notification.id, &self.claimer, &error.to_string())
                    .await?;
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                counter!("belay_notifications_failed_total").increment(1);
                warn!(
                    notification_id = %notification.id,
                    error = %error,
                    "recipient lookup failed"
                );
                return Ok(ItemOutcome::Failed);
            }
        };

        if !recipient.subscribed {
            self.store
                .mark_notification_skipped(notification.id, &self.claimer, SkipReason::Unsubscribed)
                .await?;
            return Ok(ItemOutcome::Skipped);
        }

        let window_start = Utc::now() - chrono::Duration::hours(SEND_WINDOW_HOURS);
        let sent_recently = self
            .store
            .sent_count_since(notification.user_id, window_start)
            .await?;
        if sent_recently >= self.daily_cap {
            self.store
                .mark_notification_skipped(notification.id, &self.claimer, SkipReason::DailyCap)
                .await?;
            debug!(
                user_id = %notification.user_id,
                sent_recently,
                "daily cap reached; skipped"
            );
            return Ok(ItemOutcome::Skipped);
        }

        match self.transport.send(&recipient, notification).await {
            Ok(provider_id) => {
                self.store
                    .mark_notification_sent(notification.id, &self.claimer, &provider_id)
                    .await?;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                counter!("belay_notifications_sent_total").increment(1);
                info!(
                    notification_id = %notification.id,
                    user_id = %notification.user_id,
                    provider_id = %provider_id,
                    "notification sent"
                );
                Ok(ItemOutcome::Sent)
            }
            Err(error) => {
                self.store
                    .mark_notification_failed(notification.id, &self.claimer, &error.to_string())
                    .await?;
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                counter!("belay_notifications_failed_total").increment(1);
                warn!(
                    notification_id = %notification.id,
                    error = %error,
                    "provider send failed"
                );
                Ok(ItemOutcome::Failed)
            }
        }
    }
}
