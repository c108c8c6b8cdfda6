//! Periodic engine tasks.
//!
//! One task drives the three background cadences: the momentum alert
//! sweep, the digest sweep, and the delivery run. Every cadence is
//! guarded by its own batch lock, so running a scheduler in each worker
//! process is safe; contenders skip and try again next tick.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::delivery::{DeliveryEngine, DeliveryOutcome};
use crate::digest::DigestSweep;
use crate::store::{AlertStore, BatchLockStore, DeliveryStore};
use crate::sweep::{AlertSweep, SweepOutcome};

pub struct SchedulerTask<S> {
    alert_sweep: AlertSweep<S>,
    digest_sweep: DigestSweep<S>,
    delivery: DeliveryEngine<S>,
    alert_interval: Duration,
    digest_interval: Duration,
    delivery_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<S> SchedulerTask<S>
where
    S: AlertStore + DeliveryStore + BatchLockStore + 'static,
{
    pub fn new(
        alert_sweep: AlertSweep<S>,
        digest_sweep: DigestSweep<S>,
        delivery: DeliveryEngine<S>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            alert_sweep,
            digest_sweep,
            delivery,
            alert_interval: Duration::from_millis(config.alert_sweep_interval_ms),
            digest_interval: Duration::from_millis(config.digest_sweep_interval_ms),
            delivery_interval: Duration::from_millis(config.delivery_run_interval_ms),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            alert_interval_ms = self.alert_interval.as_millis() as u64,
            digest_interval_ms = self.digest_interval.as_millis() as u64,
            delivery_interval_ms = self.delivery_interval.as_millis() as u64,
            "scheduler started"
        );

        let mut alert_tick = tokio::time::interval(self.alert_interval);
        let mut digest_tick = tokio::time::interval(self.digest_interval);
        let mut delivery_tick = tokio::time::interval(self.delivery_interval);
        alert_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        digest_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        delivery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Each interval fires once immediately, so a fresh process sweeps
        // and drains the backlog at startup.
        loop {
            tokio::select! {
                _ = alert_tick.tick() => {
                    match self.alert_sweep.run().await {
                        Ok(SweepOutcome::Completed { notifications }) => {
                            debug!(notifications, "alert sweep completed");
                        }
                        Ok(SweepOutcome::Skipped) => {
                            debug!("alert sweep skipped; lock contended");
                        }
                        Err(error) => error!(error = %error, "alert sweep failed"),
                    }
                }
                _ = digest_tick.tick() => {
                    match self.digest_sweep.run().await {
                        Ok(SweepOutcome::Completed { notifications }) => {
                            debug!(notifications, "digest sweep completed");
                        }
                        Ok(SweepOutcome::Skipped) => {
                            debug!("digest sweep skipped; lock contended");
                        }
                        Err(error) => error!(error = %error, "digest sweep failed"),
                    }
                }
                _ = delivery_tick.tick() => {
                    match self.delivery.run().await {
                        Ok(DeliveryOutcome::Completed(report)) => {
                            debug!(
                                sent = report.sent,
                                skipped = report.skipped,
                                failed = report.failed,
                                breaker_tripped = report.breaker_tripped,
                                "delivery run completed"
                            );
                        }
                        Ok(DeliveryOutcome::Skipped) => {
                            debug!("delivery run skipped; lock contended");
                        }
                        Err(error) => error!(error = %error, "delivery run failed"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn a scheduler task. Returns the join handle and a shutdown sender;
/// send `true` to stop the loop.
pub fn spawn_scheduler<S>(
    alert_sweep: AlertSweep<S>,
    digest_sweep: DigestSweep<S>,
    delivery: DeliveryEngine<S>,
    config: &Config,
) -> (JoinHandle<()>, watch::Sender<bool>)
where
    S: AlertStore + DeliveryStore + BatchLockStore + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = SchedulerTask::new(alert_sweep, digest_sweep, delivery, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use serde_json::json;

    use super::*;
    use crate::store::{DeliveryStatus, MemoryStore, NotificationKind, UserId};
    use crate::test_support::{
        FakeDigestSource, FakeRecipientDirectory, FakeStartupDirectory, FakeWatchlistDirectory,
        ScriptedTransport, recipient, sample_startup,
    };

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        handle: JoinHandle<()>,
        shutdown: watch::Sender<bool>,
    }

    /// One watched startup already hot, its watcher subscribed to both
    /// alerts and digests, transport succeeding.
    fn spawn_harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let watchlists = Arc::new(FakeWatchlistDirectory::new());
        let recipients = Arc::new(FakeRecipientDirectory::new());
        let source = Arc::new(FakeDigestSource::new());
        let transport = Arc::new(ScriptedTransport::new());
        let config = Config::test_config("postgres://unused");

        let watcher = UserId::new();
        let mut startup = sample_startup("Loopwire", &["fintech"], 60.0);
        startup.momentum = Some(82.0);
        let startup_id = startup.id;
        startups.add(startup);
        watchlists.add(startup_id, &[watcher]);
        let mut enrolled = recipient(watcher, true);
        enrolled.digest_enabled = true;
        recipients.add(enrolled);
        source.set_content(watcher, json!({ "new_matches": 2 }));

        let alert_sweep = AlertSweep::new(
            store.clone(),
            watchlists.clone(),
            startups.clone(),
            &config,
        );
        let digest_sweep = DigestSweep::new(
            store.clone(),
            recipients.clone(),
            source.clone(),
            &config,
        );
        let delivery = DeliveryEngine::new(
            store.clone(),
            recipients.clone(),
            transport.clone(),
            &config,
        );
        let (handle, shutdown) = spawn_scheduler(alert_sweep, digest_sweep, delivery, &config);

        Harness {
            store,
            transport,
            handle,
            shutdown,
        }
    }

    #[tokio::test]
    async fn scheduler_sweeps_and_delivers() {
        let harness = spawn_harness();

        // Alert and digest sweeps each create one row; delivery drains
        // them on its next ticks.
        let deadline = Instant::now() + Duration::from_secs(2);
        while harness.transport.sent().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        harness.shutdown.send(true).unwrap();
        harness.handle.await.unwrap();

        let rows = harness.store.all_notifications();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|n| n.delivery_status == DeliveryStatus::Sent));
        assert!(rows.iter().any(|n| n.kind == NotificationKind::MomentumAlert));
        assert!(rows.iter().any(|n| n.kind == NotificationKind::Digest));
    }

    #[tokio::test]
    async fn shutdown_stops_the_scheduler() {
        let harness = spawn_harness();

        harness.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), harness.handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
