//! In-process store used by tests and broker-free local runs.
//!
//! Every operation re-checks its guard inside the mutex, the same way the
//! Postgres store re-checks inside the UPDATE's WHERE clause, so claim and
//! delivery races behave identically across the two implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    AlertStore, BatchLockStore, DeliveryStatus, DeliveryStore, JobId, JobKind, JobRecord, JobStatus,
    JobStore, NewNotification, Notification, NotificationId, NotificationKind, Signal, SkipReason,
    StartupId, StoreResult, TraceEntry, UserId,
};

#[derive(Default)]
struct MemoryState {
    job_order: Vec<JobId>,
    jobs: HashMap<JobId, JobRecord>,
    notification_order: Vec<NotificationId>,
    notifications: HashMap<NotificationId, Notification>,
    baselines: HashMap<(StartupId, Signal), f64>,
    cooldowns: HashMap<(UserId, NotificationKind, StartupId), DateTime<Utc>>,
    batch_locks: HashMap<String, BatchLockRow>,
}

struct BatchLockRow {
    holder: String,
    locked_at: DateTime<Utc>,
}

/// Shared-handle in-memory store; clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Snapshot of every notification row in insertion order.
    pub fn all_notifications(&self) -> Vec<Notification> {
        let state = self.state();
        state
            .notification_order
            .iter()
            .filter_map(|id| state.notifications.get(id).cloned())
            .collect()
    }
}

fn is_eligible(job: &JobRecord, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Queued => true,
        JobStatus::Processing => job.lock_expires_at.is_some_and(|expires| expires < now),
        _ => false,
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_job(&self, kind: JobKind, startup_id: StartupId) -> StoreResult<JobRecord> {
        let job = JobRecord {
            id: JobId::new(),
            kind,
            startup_id,
            status: JobStatus::Queued,
            progress_step: None,
            lock_owner: None,
            lock_expires_at: None,
            debug_trace: Vec::new(),
            result_count: None,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut state = self.state();
        state.job_order.push(job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn select_candidate(&self) -> StoreResult<Option<JobRecord>> {
        let now = Utc::now();
        let state = self.state();
        for id in &state.job_order {
            if let Some(job) = state.jobs.get(id) {
                if is_eligible(job, now) {
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn try_acquire(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !is_eligible(job, now) {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.lock_owner = Some(worker_id.to_string());
        job.lock_expires_at = Some(now + chrono::Duration::seconds(lease_seconds));
        Ok(true)
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.lock_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.lock_expires_at = Some(Utc::now() + chrono::Duration::seconds(lease_seconds));
        Ok(true)
    }

    async fn record_step(
        &self,
        job_id: JobId,
        worker_id: &str,
        step: &str,
        trace: &[TraceEntry],
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.lock_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.progress_step = Some(step.to_string());
        job.debug_trace = trace.to_vec();
        Ok(true)
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result_count: i32,
        final_status: JobStatus,
        trace: &[TraceEntry],
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.lock_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.status = final_status;
        job.result_count = Some(result_count);
        job.debug_trace = trace.to_vec();
        job.lock_owner = None;
        job.lock_expires_at = None;
        job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        trace: &[TraceEntry],
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.lock_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error_code = Some(error_code.to_string());
        job.error_message = Some(error_message.to_string());
        job.debug_trace = trace.to_vec();
        job.lock_owner = None;
        job.lock_expires_at = None;
        job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.state().jobs.get(&job_id).cloned())
    }
}

#[async_trait]
impl BatchLockStore for MemoryStore {
    async fn try_acquire_batch_lock(
        &self,
        key: &str,
        holder: &str,
        stale_after: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut state = self.state();
        match state.batch_locks.get_mut(key) {
            None => {
                state.batch_locks.insert(
                    key.to_string(),
                    BatchLockRow {
                        holder: holder.to_string(),
                        locked_at: now,
                    },
                );
                Ok(true)
            }
            Some(row) => {
                let stale = now - row.locked_at
                    > chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
                if row.holder == holder || stale {
                    row.holder = holder.to_string();
                    row.locked_at = now;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn release_batch_lock(&self, key: &str, holder: &str) -> StoreResult<()> {
        let mut state = self.state();
        if state
            .batch_locks
            .get(key)
            .is_some_and(|row| row.holder == holder)
        {
            state.batch_locks.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn signal_baseline(
        &self,
        startup_id: StartupId,
        signal: Signal,
    ) -> StoreResult<Option<f64>> {
        Ok(self.state().baselines.get(&(startup_id, signal)).copied())
    }

    async fn upsert_signal_baseline(
        &self,
        startup_id: StartupId,
        signal: Signal,
        value: f64,
    ) -> StoreResult<()> {
        self.state().baselines.insert((startup_id, signal), value);
        Ok(())
    }

    async fn last_alert_at(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        startup_id: StartupId,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .state()
            .cooldowns
            .get(&(user_id, kind, startup_id))
            .copied())
    }

    async fn record_alert(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        startup_id: StartupId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.state().cooldowns.insert((user_id, kind, startup_id), at);
        Ok(())
    }

    async fn insert_notification(&self, new: NewNotification) -> StoreResult<NotificationId> {
        let row = Notification {
            id: NotificationId::new(),
            user_id: new.user_id,
            startup_id: new.startup_id,
            kind: new.kind,
            payload: new.payload,
            delivery_status: DeliveryStatus::Pending,
            claimed_by: None,
            sent_at: None,
            provider_id: None,
            skip_reason: None,
            error: None,
            created_at: Utc::now(),
        };
        let id = row.id;
        let mut state = self.state();
        state.notification_order.push(id);
        state.notifications.insert(id, row);
        Ok(id)
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn pending_notifications(&self, limit: i64) -> StoreResult<Vec<Notification>> {
        let state = self.state();
        Ok(state
            .notification_order
            .iter()
            .filter_map(|id| state.notifications.get(id))
            .filter(|row| row.delivery_status == DeliveryStatus::Pending)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_notification(&self, id: NotificationId, claimer: &str) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(row) = state.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if row.delivery_status != DeliveryStatus::Pending {
            return Ok(false);
        }
        row.delivery_status = DeliveryStatus::Claiming;
        row.claimed_by = Some(claimer.to_string());
        Ok(true)
    }

    async fn mark_notification_sent(
        &self,
        id: NotificationId,
        claimer: &str,
        provider_id: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(row) = state.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if row.delivery_status != DeliveryStatus::Claiming
            || row.claimed_by.as_deref() != Some(claimer)
        {
            return Ok(false);
        }
        row.delivery_status = DeliveryStatus::Sent;
        row.sent_at = Some(Utc::now());
        row.provider_id = Some(provider_id.to_string());
        Ok(true)
    }

    async fn mark_notification_skipped(
        &self,
        id: NotificationId,
        claimer: &str,
        reason: SkipReason,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(row) = state.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if row.delivery_status != DeliveryStatus::Claiming
            || row.claimed_by.as_deref() != Some(claimer)
        {
            return Ok(false);
        }
        row.delivery_status = DeliveryStatus::Skipped;
        row.skip_reason = Some(reason);
        Ok(true)
    }

    async fn mark_notification_failed(
        &self,
        id: NotificationId,
        claimer: &str,
        error: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(row) = state.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if row.delivery_status != DeliveryStatus::Claiming
            || row.claimed_by.as_deref() != Some(claimer)
        {
            return Ok(false);
        }
        row.delivery_status = DeliveryStatus::Failed;
        row.error = Some(error.to_string());
        Ok(true)
    }

    async fn sent_count_since(&self, user_id: UserId, since: DateTime<Utc>) -> StoreResult<i64> {
        let state = self.state();
        let count = state
            .notifications
            .values()
            .filter(|row| {
                row.user_id == user_id
                    && row.delivery_status == DeliveryStatus::Sent
                    && row.sent_at.is_some_and(|at| at >= since)
            })
            .count();
        Ok(count as i64)
    }
}
