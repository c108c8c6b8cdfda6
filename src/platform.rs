//! Contracts to the rest of the platform.
//!
//! The engine never talks to platform tables or external providers
//! directly; everything it needs from the wider system comes through the
//! traits in this module. Production implementations live elsewhere in
//! the platform; this crate ships test fakes and the seed-backed
//! implementations used by the standalone worker binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Notification, StartupId, UserId};

/// Unique identifier for an investor profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvestorId(pub Uuid);

impl InvestorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvestorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvestorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a startup as the directory knows it.
#[derive(Debug, Clone)]
pub struct StartupRecord {
    pub id: StartupId,
    pub name: String,
    pub categories: Vec<String>,
    pub stage: Option<String>,
    pub quality_score: f64,
    /// Current momentum signal, when the platform computes one.
    pub momentum: Option<f64>,
    pub enrichment: Option<Enrichment>,
}

/// Enrichment data attached to a startup profile.
///
/// Considered rich when more than three fields are populated; a rich
/// enrichment lets the extract step skip the expensive refresh.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub summary: Option<String>,
    pub website: Option<String>,
    pub team_size: Option<i32>,
    pub funding_raised: Option<f64>,
    pub tech_stack: Option<Vec<String>>,
}

impl Enrichment {
    pub fn populated_fields(&self) -> usize {
        [
            self.summary.is_some(),
            self.website.is_some(),
            self.team_size.is_some(),
            self.funding_raised.is_some(),
            self.tech_stack.is_some(),
        ]
        .iter()
        .filter(|populated| **populated)
        .count()
    }

    pub fn is_rich(&self) -> bool {
        self.populated_fields() > 3
    }
}

/// An investor eligible for match suggestions.
#[derive(Debug, Clone)]
pub struct InvestorRecord {
    pub id: InvestorId,
    pub name: String,
    pub categories: Vec<String>,
    pub preferred_stages: Vec<String>,
    /// Platform-assigned starting score for this investor's matches.
    pub base_score: f64,
}

/// One scored startup/investor pairing produced by the rank step.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedMatch {
    pub investor_id: InvestorId,
    pub score: f64,
}

/// A startup somebody watches, with its watchers.
#[derive(Debug, Clone)]
pub struct WatchedStartup {
    pub startup_id: StartupId,
    pub watcher_ids: Vec<UserId>,
}

/// Where and whether a user can be notified.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: UserId,
    pub address: String,
    pub subscribed: bool,
    pub digest_enabled: bool,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider rejected the message: {0}")]
    Rejected(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Startup profiles and enrichment refresh.
#[async_trait]
pub trait StartupDirectory: Send + Sync {
    async fn startup(&self, id: StartupId) -> PlatformResult<Option<StartupRecord>>;

    /// Re-run enrichment for a startup. Expensive; the extract step only
    /// calls this when the cached enrichment is missing or sparse.
    async fn refresh_enrichment(&self, id: StartupId) -> PlatformResult<Enrichment>;
}

/// Investors currently eligible to receive suggestions.
#[async_trait]
pub trait InvestorDirectory: Send + Sync {
    async fn eligible_investors(&self) -> PlatformResult<Vec<InvestorRecord>>;
}

/// Sink for a finished match run.
#[async_trait]
pub trait MatchWriter: Send + Sync {
    /// Replace every previously suggested match for the startup with the
    /// ranked set, in one logical write. Returns the count actually
    /// persisted.
    async fn replace_suggested(
        &self,
        startup_id: StartupId,
        matches: &[RankedMatch],
    ) -> PlatformResult<usize>;
}

/// Which startups are watched, and by whom.
#[async_trait]
pub trait WatchlistDirectory: Send + Sync {
    async fn watched_startups(&self) -> PlatformResult<Vec<WatchedStartup>>;
}

/// Recipient lookup and digest enrollment.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipient(&self, user_id: UserId) -> PlatformResult<Option<Recipient>>;

    async fn digest_recipients(&self) -> PlatformResult<Vec<Recipient>>;
}

/// Digest body assembly.
#[async_trait]
pub trait DigestSource: Send + Sync {
    /// Content for a user's digest covering everything since `since`
    /// (None for a first digest). None means nothing worth sending.
    async fn digest_content(
        &self,
        user_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Option<serde_json::Value>>;
}

/// Outbound provider for notifications.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Send one notification. Ok carries the provider's message id.
    async fn send(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<String, TransportError>;
}
