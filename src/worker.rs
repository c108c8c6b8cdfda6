//! The worker loop: poll, claim, execute, repeat.
//!
//! A worker is one identity in the claim protocol. It never dies to a
//! bad job: errors escaping processing are logged and followed by a
//! short backoff, then the loop polls again.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::lease::LeaseKeeper;
use crate::pipeline::{MatchPipeline, PipelineExecutor, ProcessOutcome};
use crate::store::{JobStore, StoreResult};

pub struct Worker<S> {
    store: Arc<S>,
    executor: PipelineExecutor<S>,
    worker_id: String,
    lease_seconds: i64,
    renew_interval: Duration,
    poll_interval: Duration,
    error_backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(
        store: Arc<S>,
        matching: MatchPipeline,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let executor = PipelineExecutor::new(store.clone(), config.worker_id.clone(), matching);
        Self {
            store,
            executor,
            worker_id: config.worker_id.clone(),
            lease_seconds: config.lease_seconds,
            renew_interval: Duration::from_millis(config.renew_interval_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(worker_id = %self.worker_id, "worker loop started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.claim_and_process().await {
                // Handled a job; look for the next one right away.
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() || *self.shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                Err(error) => {
                    error!(worker_id = %self.worker_id, error = %error, "job processing error");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() || *self.shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "worker loop stopped");
    }

    /// One poll. Returns true when a job was claimed and handled, false
    /// when there was nothing to do (or the claim went to someone else).
    async fn claim_and_process(&self) -> StoreResult<bool> {
        let Some(candidate) = self.store.select_candidate().await? else {
            return Ok(false);
        };

        let acquired = self
            .store
            .try_acquire(candidate.id, &self.worker_id, self.lease_seconds)
            .await?;
        if !acquired {
            debug!(job_id = %candidate.id, "claim went to another worker");
            return Ok(false);
        }
        counter!("belay_jobs_claimed_total").increment(1);
        info!(
            job_id = %candidate.id,
            startup_id = %candidate.startup_id,
            "claimed job"
        );

        // Re-read after the claim; a reclaimed job carries prior trace.
        let Some(job) = self.store.get_job(candidate.id).await? else {
            return Ok(true);
        };

        let keeper = LeaseKeeper::spawn(
            self.store.clone(),
            job.id,
            self.worker_id.clone(),
            self.lease_seconds,
            self.renew_interval,
        );
        let outcome = self.executor.process(&job).await;
        keeper.stop().await;

        if let ProcessOutcome::LeaseLost = outcome? {
            warn!(job_id = %job.id, "job was reclaimed mid-run");
        }
        Ok(true)
    }
}

/// Spawn a worker loop; the returned sender stops it.
pub fn spawn_worker<S: JobStore + 'static>(
    store: Arc<S>,
    matching: MatchPipeline,
    config: &Config,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(store, matching, config, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}
