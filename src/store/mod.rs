//! Persistence layer for the job engine.
//!
//! The store is the only coordination medium between workers: every
//! mutation of `status`/`lock_owner`/`lock_expires_at` goes through the
//! conditional-update operations defined here, never through a plain
//! read-modify-write in application code.
//!
//! Two implementations:
//! - `PostgresStore`: the production store; claims and lease renewals are
//!   single atomic UPDATEs guarded by the eligibility predicate.
//! - `MemoryStore`: the same semantics over in-process maps, for tests
//!   and broker-free local runs.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

// ============================================================================
// Newtype Ids
// ============================================================================

/// Unique identifier for a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a startup (the subject a job operates on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartupId(pub Uuid);

impl StartupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Placeholder subject for notifications that are not about one
    /// startup (digests).
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for StartupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StartupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a platform user (alert recipient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a notification row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Kind of work a job row represents; selects the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    MatchGeneration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MatchGeneration => "match_generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "match_generation" => Some(Self::MatchGeneration),
            _ => None,
        }
    }
}

/// Delivery status of a notification row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Claiming,
    Sent,
    Skipped,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claiming => "claiming",
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claiming" => Some(Self::Claiming),
            "sent" => Some(Self::Sent),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Skipped | Self::Failed)
    }
}

/// What a notification is about; selects template and cooldown scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    MomentumAlert,
    Digest,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MomentumAlert => "momentum_alert",
            Self::Digest => "digest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "momentum_alert" => Some(Self::MomentumAlert),
            "digest" => Some(Self::Digest),
            _ => None,
        }
    }
}

/// Why a claimed notification was skipped instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DailyCap,
    Unsubscribed,
    NoRecipient,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyCap => "daily_cap",
            Self::Unsubscribed => "unsubscribed",
            Self::NoRecipient => "no_recipient",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily_cap" => Some(Self::DailyCap),
            "unsubscribed" => Some(Self::Unsubscribed),
            "no_recipient" => Some(Self::NoRecipient),
            _ => None,
        }
    }
}

/// A watched signal on a startup; baselines are kept per (startup, signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Momentum,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Momentum => "momentum",
        }
    }
}

// ============================================================================
// Model Structs
// ============================================================================

/// One structured entry in a job's debug trace.
///
/// Entries are append-only: each pipeline step records what it consulted,
/// what it produced, and any anomalies, so a resumed or failed job can be
/// audited without re-running anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step: String,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl TraceEntry {
    pub fn new(step: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            step: step.into(),
            at: Utc::now(),
            detail,
        }
    }
}

/// A job row: one unit of asynchronous work against one startup.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub startup_id: StartupId,
    pub status: JobStatus,
    /// Last step entered; never rolled back on lease handover.
    pub progress_step: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub debug_trace: Vec<TraceEntry>,
    pub result_count: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A notification row produced by a sweep and consumed by the delivery
/// engine.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub startup_id: Option<StartupId>,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub delivery_status: DeliveryStatus,
    pub claimed_by: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_id: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new notification row.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: UserId,
    pub startup_id: Option<StartupId>,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid column value: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Capability Traits
// ============================================================================

/// Job backlog operations: enqueue, the claim protocol, lease renewal,
/// step-by-step progress, and terminal transitions.
///
/// `try_acquire` is the single place the "multiple workers, one job" race
/// is resolved: its WHERE clause re-evaluates eligibility at write time,
/// so the earlier `select_candidate` is advisory only.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `queued` job and return the stored row.
    async fn enqueue_job(&self, kind: JobKind, startup_id: StartupId) -> StoreResult<JobRecord>;

    /// Oldest eligible job (`queued`, or `processing` with an expired
    /// lease), or none. Read-only.
    async fn select_candidate(&self) -> StoreResult<Option<JobRecord>>;

    /// Atomically take ownership of a still-eligible job. Returns false
    /// when another worker got there first.
    async fn try_acquire(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool>;

    /// Extend the lease while still the owner. A reclaimed job makes this
    /// a no-op (returns false).
    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> StoreResult<bool>;

    /// Persist the progress marker and the trace accumulated so far.
    /// Owner-guarded; returns false when the lease was lost.
    async fn record_step(
        &self,
        job_id: JobId,
        worker_id: &str,
        step: &str,
        trace: &[TraceEntry],
    ) -> StoreResult<bool>;

    /// Terminal success: set the final status, result count, and full
    /// trace, and clear the lease. Owner-guarded.
    async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result_count: i32,
        final_status: JobStatus,
        trace: &[TraceEntry],
    ) -> StoreResult<bool>;

    /// Terminal failure: record the error code/message and full trace,
    /// and clear the lease. Owner-guarded.
    async fn fail_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        trace: &[TraceEntry],
    ) -> StoreResult<bool>;

    /// Fetch a job row by id (status/trace observers).
    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<JobRecord>>;
}

/// Named mutual-exclusion tokens guarding whole batches.
#[async_trait]
pub trait BatchLockStore: Send + Sync {
    /// Take the named lock. Succeeds when the lock is free or its holder
    /// went stale (`locked_at` older than `stale_after`).
    async fn try_acquire_batch_lock(
        &self,
        key: &str,
        holder: &str,
        stale_after: Duration,
    ) -> StoreResult<bool>;

    /// Release the named lock if still held by `holder`.
    async fn release_batch_lock(&self, key: &str, holder: &str) -> StoreResult<()>;
}

/// Sweep-side state: signal baselines, per-recipient cooldowns, and
/// notification creation.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn signal_baseline(
        &self,
        startup_id: StartupId,
        signal: Signal,
    ) -> StoreResult<Option<f64>>;

    async fn upsert_signal_baseline(
        &self,
        startup_id: StartupId,
        signal: Signal,
        value: f64,
    ) -> StoreResult<()>;

    /// When this user was last alerted for (kind, startup), if ever.
    async fn last_alert_at(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        startup_id: StartupId,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    async fn record_alert(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        startup_id: StartupId,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn insert_notification(&self, new: NewNotification) -> StoreResult<NotificationId>;
}

/// Delivery-side operations: the row-level CAS claim and its terminal
/// transitions, plus the rolling sent count backing the daily cap.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Pending notifications oldest-first, bounded.
    async fn pending_notifications(&self, limit: i64) -> StoreResult<Vec<Notification>>;

    /// CAS `pending -> claiming`. Only the caller whose update changed
    /// the row may act on it.
    async fn claim_notification(&self, id: NotificationId, claimer: &str) -> StoreResult<bool>;

    async fn mark_notification_sent(
        &self,
        id: NotificationId,
        claimer: &str,
        provider_id: &str,
    ) -> StoreResult<bool>;

    async fn mark_notification_skipped(
        &self,
        id: NotificationId,
        claimer: &str,
        reason: SkipReason,
    ) -> StoreResult<bool>;

    async fn mark_notification_failed(
        &self,
        id: NotificationId,
        claimer: &str,
        error: &str,
    ) -> StoreResult<bool>;

    /// Number of notifications sent to this user since `since`.
    async fn sent_count_since(&self, user_id: UserId, since: DateTime<Utc>) -> StoreResult<i64>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Ready,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Ready.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn delivery_status_roundtrip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Claiming,
            DeliveryStatus::Sent,
            DeliveryStatus::Skipped,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse(""), None);
    }

    #[test]
    fn skip_reason_roundtrip() {
        for reason in [
            SkipReason::DailyCap,
            SkipReason::Unsubscribed,
            SkipReason::NoRecipient,
        ] {
            assert_eq!(SkipReason::parse(reason.as_str()), Some(reason));
        }
    }

    #[test]
    fn ids_display_as_uuids() {
        let id = JobId::new();
        assert!(Uuid::parse_str(&id.to_string()).is_ok());
        let id = NotificationId::new();
        assert!(Uuid::parse_str(&id.to_string()).is_ok());
    }

    #[test]
    fn trace_entry_serializes_with_step_and_detail() {
        let entry = TraceEntry::new("rank", serde_json::json!({ "kept": 2 }));
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["step"], "rank");
        assert_eq!(value["detail"]["kept"], 2);
    }
}
