//! Background lease renewal scoped to one job-processing call.
//!
//! A `LeaseKeeper` is spawned right after a successful claim and must
//! never outlive the processing call it guards: `stop` ends it on the
//! orderly paths and `Drop` aborts the task on every other path,
//! panics included.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::store::{JobId, JobStore};

pub struct LeaseKeeper {
    handle: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl LeaseKeeper {
    /// Start renewing the lease on `job_id` every `renew_every`.
    ///
    /// Renewal is owner-guarded: once the job is reclaimed by someone
    /// else the extend becomes a no-op and the keeper goes quiet rather
    /// than fighting for a lease it lost.
    pub fn spawn<S>(
        store: Arc<S>,
        job_id: JobId,
        worker_id: String,
        lease_seconds: i64,
        renew_every: Duration,
    ) -> Self
    where
        S: JobStore + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the claim just set the
            // lease, so skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.extend_lease(job_id, &worker_id, lease_seconds).await {
                            Ok(true) => {
                                debug!(job_id = %job_id, "lease renewed");
                            }
                            Ok(false) => {
                                warn!(
                                    job_id = %job_id,
                                    worker_id = %worker_id,
                                    "lease renewal rejected; job was reclaimed"
                                );
                                break;
                            }
                            Err(error) => {
                                // Transient store trouble: keep trying while
                                // the current lease still has time left.
                                warn!(job_id = %job_id, error = %error, "lease renewal failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
            shutdown: shutdown_tx,
        }
    }

    /// Orderly shutdown: signal the task and wait for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobKind, MemoryStore, StartupId};

    #[tokio::test]
    async fn keeper_extends_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .enqueue_job(JobKind::MatchGeneration, StartupId::new())
            .await
            .unwrap();
        assert!(store.try_acquire(job.id, "worker-a", 60).await.unwrap());
        let initial_expiry = store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .lock_expires_at
            .unwrap();

        let keeper = LeaseKeeper::spawn(
            store.clone(),
            job.id,
            "worker-a".to_string(),
            60,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        keeper.stop().await;

        let renewed_expiry = store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .lock_expires_at
            .unwrap();
        assert!(renewed_expiry > initial_expiry);
    }

    #[tokio::test]
    async fn keeper_goes_quiet_after_reclaim() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .enqueue_job(JobKind::MatchGeneration, StartupId::new())
            .await
            .unwrap();
        // Expired immediately, so another worker can take it over.
        assert!(store.try_acquire(job.id, "worker-a", -5).await.unwrap());

        let keeper = LeaseKeeper::spawn(
            store.clone(),
            job.id,
            "worker-a".to_string(),
            60,
            Duration::from_millis(10),
        );
        assert!(store.try_acquire(job.id, "worker-b", 60).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        keeper.stop().await;

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.lock_owner.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn dropping_the_keeper_stops_renewal() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .enqueue_job(JobKind::MatchGeneration, StartupId::new())
            .await
            .unwrap();
        assert!(store.try_acquire(job.id, "worker-a", 60).await.unwrap());

        let keeper = LeaseKeeper::spawn(
            store.clone(),
            job.id,
            "worker-a".to_string(),
            60,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(keeper);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let expiry_after_drop = store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .lock_expires_at
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let expiry_later = store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .lock_expires_at
            .unwrap();
        assert_eq!(expiry_after_drop, expiry_later);
    }
}
