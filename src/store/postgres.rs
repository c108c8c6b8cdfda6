//! Postgres-backed store.
//!
//! All claim-protocol and delivery-claim writes are single conditional
//! UPDATEs whose WHERE clause re-checks eligibility or ownership, so a
//! `rows_affected == 1` result is the only success signal and no
//! transaction-level locking is needed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{
    AlertStore, BatchLockStore, DeliveryStatus, DeliveryStore, JobId, JobKind, JobRecord, JobStatus,
    JobStore, NewNotification, Notification, NotificationId, NotificationKind, Signal, SkipReason,
    StartupId, StoreError, StoreResult, TraceEntry, UserId,
};

const JOB_COLUMNS: &str = "id, kind, startup_id, status, progress_step, lock_owner, \
     lock_expires_at, debug_trace, result_count, error_code, error_message, \
     created_at, completed_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, startup_id, kind, payload, delivery_status, \
     claimed_by, sent_at, provider_id, skip_reason, error, created_at";

/// Store backed by a shared `match_jobs`/`notifications` schema.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<JobRecord> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let trace_value: serde_json::Value = row.try_get("debug_trace")?;
    Ok(JobRecord {
        id: JobId(row.try_get::<Uuid, _>("id")?),
        kind: JobKind::parse(&kind)
            .ok_or_else(|| StoreError::Invalid(format!("job kind: {kind}")))?,
        startup_id: StartupId(row.try_get::<Uuid, _>("startup_id")?),
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("job status: {status}")))?,
        progress_step: row.try_get("progress_step")?,
        lock_owner: row.try_get("lock_owner")?,
        lock_expires_at: row.try_get("lock_expires_at")?,
        debug_trace: serde_json::from_value(trace_value)?,
        result_count: row.try_get("result_count")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> StoreResult<Notification> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("delivery_status")?;
    let skip_reason: Option<String> = row.try_get("skip_reason")?;
    Ok(Notification {
        id: NotificationId(row.try_get::<Uuid, _>("id")?),
        user_id: UserId(row.try_get::<Uuid, _>("user_id")?),
        startup_id: row.try_get::<Option<Uuid>, _>("startup_id")?.map(StartupId),
        kind: NotificationKind::parse(&kind)
            .ok_or_else(|| StoreError::Invalid(format!("notification kind: {kind}")))?,
        payload: row.try_get("payload")?,
        delivery_status: DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("delivery status: {status}")))?,
        claimed_by: row.try_get("claimed_by")?,
        sent_at: row.try_get("sent_at")?,
        provider_id: row.try_get("provider_id")?,
        skip_reason: match skip_reason {
            Some(raw) => Some(
                SkipReason::parse(&raw)
                    .ok_or_else(|| StoreError::Invalid(format!("skip reason: {raw}")))?,
            ),
            None => None,
        },
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue_job(&self, kind: JobKind, startup_id: StartupId) -> StoreResult<JobRecord> {
        let sql = format!(
            "INSERT INTO match_jobs (id, kind, startup_id, status)
             VALUES ($1, $2, $3, 'queued')
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(JobId::new().0)
            .bind(kind.as_str())
            .bind(startup_id.0)
            .fetch_one(&self.pool)
            .await?;
        job_from_row(&row)
    }

    async fn select_candidate(&self) -> StoreResult<Option<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS}
             FROM match_jobs
             WHERE status = 'queued'
                OR (status = 'processing' AND lock_expires_at < NOW())
             ORDER BY created_at ASC
             LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn try_acquire(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool> {
        // Eligibility is re-evaluated here, inside the UPDATE: the row a
        // candidate scan returned may have been claimed in between.
        let result = sqlx::query(
            "UPDATE match_jobs
             SET status = 'processing',
                 lock_owner = $2,
                 lock_expires_at = NOW() + ($3 || ' seconds')::interval
             WHERE id = $1
               AND (status = 'queued'
                    OR (status = 'processing' AND lock_expires_at < NOW()))",
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(lease_seconds.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE match_jobs
             SET lock_expires_at = NOW() + ($3 || ' seconds')::interval
             WHERE id = $1 AND lock_owner = $2 AND status = 'processing'",
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(lease_seconds.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_step(
        &self,
        job_id: JobId,
        worker_id: &str,
        step: &str,
        trace: &[TraceEntry],
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE match_jobs
             SET progress_step = $3, debug_trace = $4
             WHERE id = $1 AND lock_owner = $2 AND status = 'processing'",
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(step)
        .bind(serde_json::to_value(trace)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result_count: i32,
        final_status: JobStatus,
        trace: &[TraceEntry],
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE match_jobs
             SET status = $3,
                 result_count = $4,
                 debug_trace = $5,
                 lock_owner = NULL,
                 lock_expires_at = NULL,
                 completed_at = NOW()
             WHERE id = $1 AND lock_owner = $2 AND status = 'processing'",
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(final_status.as_str())
        .bind(result_count)
        .bind(serde_json::to_value(trace)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        trace: &[TraceEntry],
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE match_jobs
             SET status = 'failed',
                 error_code = $3,
                 error_message = $4,
                 debug_trace = $5,
                 lock_owner = NULL,
                 lock_expires_at = NULL,
                 completed_at = NOW()
             WHERE id = $1 AND lock_owner = $2 AND status = 'processing'",
        )
        .bind(job_id.0)
        .bind(worker_id)
        .bind(error_code)
        .bind(error_message)
        .bind(serde_json::to_value(trace)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM match_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl BatchLockStore for PostgresStore {
    async fn try_acquire_batch_lock(
        &self,
        key: &str,
        holder: &str,
        stale_after: Duration,
    ) -> StoreResult<bool> {
        // Upsert succeeds when the row is new, already ours, or stale.
        let result = sqlx::query(
            "INSERT INTO batch_locks (key, holder, locked_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE
             SET holder = EXCLUDED.holder, locked_at = NOW()
             WHERE batch_locks.holder = EXCLUDED.holder
                OR batch_locks.locked_at < NOW() - ($3 || ' seconds')::interval",
        )
        .bind(key)
        .bind(holder)
        .bind((stale_after.as_secs() as i64).to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_batch_lock(&self, key: &str, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM batch_locks WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PostgresStore {
    async fn signal_baseline(
        &self,
        startup_id: StartupId,
        signal: Signal,
    ) -> StoreResult<Option<f64>> {
        let row = sqlx::query(
            "SELECT last_value FROM alert_baselines WHERE startup_id = $1 AND signal = $2",
        )
        .bind(startup_id.0)
        .bind(signal.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<f64, _>("last_value").map_err(StoreError::from))
            .transpose()
    }

    async fn upsert_signal_baseline(
        &self,
        startup_id: StartupId,
        signal: Signal,
        value: f64,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO alert_baselines (startup_id, signal, last_value, observed_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (startup_id, signal) DO UPDATE
             SET last_value = EXCLUDED.last_value, observed_at = NOW()",
        )
        .bind(startup_id.0)
        .bind(signal.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_alert_at(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        startup_id: StartupId,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_alerted_at FROM alert_cooldowns
             WHERE user_id = $1 AND kind = $2 AND startup_id = $3",
        )
        .bind(user_id.0)
        .bind(kind.as_str())
        .bind(startup_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            r.try_get::<DateTime<Utc>, _>("last_alerted_at")
                .map_err(StoreError::from)
        })
        .transpose()
    }

    async fn record_alert(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        startup_id: StartupId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO alert_cooldowns (user_id, kind, startup_id, last_alerted_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, kind, startup_id) DO UPDATE
             SET last_alerted_at = EXCLUDED.last_alerted_at",
        )
        .bind(user_id.0)
        .bind(kind.as_str())
        .bind(startup_id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_notification(&self, new: NewNotification) -> StoreResult<NotificationId> {
        let id = NotificationId::new();
        sqlx::query(
            "INSERT INTO notifications (id, user_id, startup_id, kind, payload, delivery_status)
             VALUES ($1, $2, $3, $4, $5, 'pending')",
        )
        .bind(id.0)
        .bind(new.user_id.0)
        .bind(new.startup_id.map(|s| s.0))
        .bind(new.kind.as_str())
        .bind(new.payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn pending_notifications(&self, limit: i64) -> StoreResult<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS}
             FROM notifications
             WHERE delivery_status = 'pending'
             ORDER BY created_at ASC
             LIMIT $1"
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn claim_notification(&self, id: NotificationId, claimer: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications
             SET delivery_status = 'claiming', claimed_by = $2
             WHERE id = $1 AND delivery_status = 'pending'",
        )
        .bind(id.0)
        .bind(claimer)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_notification_sent(
        &self,
        id: NotificationId,
        claimer: &str,
        provider_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications
             SET delivery_status = 'sent', sent_at = NOW(), provider_id = $3
             WHERE id = $1 AND claimed_by = $2 AND delivery_status = 'claiming'",
        )
        .bind(id.0)
        .bind(claimer)
        .bind(provider_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_notification_skipped(
        &self,
        id: NotificationId,
        claimer: &str,
        reason: SkipReason,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications
             SET delivery_status = 'skipped', skip_reason = $3
             WHERE id = $1 AND claimed_by = $2 AND delivery_status = 'claiming'",
        )
        .bind(id.0)
        .bind(claimer)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_notification_failed(
        &self,
        id: NotificationId,
        claimer: &str,
        error: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications
             SET delivery_status = 'failed', error = $3
             WHERE id = $1 AND claimed_by = $2 AND delivery_status = 'claiming'",
        )
        .bind(id.0)
        .bind(claimer)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sent_count_since(&self, user_id: UserId, since: DateTime<Utc>) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS sent
             FROM notifications
             WHERE user_id = $1 AND delivery_status = 'sent' AND sent_at >= $2",
        )
        .bind(user_id.0)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("sent")?)
    }
}
