//! Fake collaborators shared by unit tests.
//!
//! Each fake records enough about the calls it receives for tests to
//! assert on interaction counts and payloads, mirroring how the real
//! platform services are consumed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::platform::{
    DeliveryTransport, DigestSource, Enrichment, InvestorDirectory, InvestorId, InvestorRecord,
    MatchWriter, PlatformResult, RankedMatch, Recipient, RecipientDirectory, StartupDirectory,
    StartupRecord, TransportError, WatchedStartup, WatchlistDirectory,
};
use crate::store::{Notification, NotificationId, StartupId, UserId};

pub fn sample_startup(name: &str, categories: &[&str], quality_score: f64) -> StartupRecord {
    StartupRecord {
        id: StartupId::new(),
        name: name.to_string(),
        categories: categories.iter().map(|c| c.to_string()).collect(),
        stage: None,
        quality_score,
        momentum: None,
        enrichment: None,
    }
}

pub fn investor(name: &str, base_score: f64, categories: &[&str]) -> InvestorRecord {
    InvestorRecord {
        id: InvestorId::new(),
        name: name.to_string(),
        categories: categories.iter().map(|c| c.to_string()).collect(),
        preferred_stages: Vec::new(),
        base_score,
    }
}

pub fn rich_enrichment() -> Enrichment {
    Enrichment {
        summary: Some("payments infrastructure for freight".to_string()),
        website: Some("https://loopwire.example.com".to_string()),
        team_size: Some(14),
        funding_raised: Some(2_000_000.0),
        tech_stack: Some(vec!["rust".to_string(), "postgres".to_string()]),
    }
}

pub fn recipient(user_id: UserId, subscribed: bool) -> Recipient {
    Recipient {
        user_id,
        address: format!("{user_id}@example.com"),
        subscribed,
        digest_enabled: false,
    }
}

#[derive(Default)]
pub struct FakeStartupDirectory {
    startups: Mutex<HashMap<StartupId, StartupRecord>>,
    refresh_result: Mutex<Option<Enrichment>>,
    refresh_calls: AtomicUsize,
}

impl FakeStartupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, startup: StartupRecord) {
        self.startups.lock().unwrap().insert(startup.id, startup);
    }

    pub fn set_momentum(&self, id: StartupId, momentum: f64) {
        if let Some(startup) = self.startups.lock().unwrap().get_mut(&id) {
            startup.momentum = Some(momentum);
        }
    }

    pub fn set_refresh_result(&self, enrichment: Enrichment) {
        *self.refresh_result.lock().unwrap() = Some(enrichment);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StartupDirectory for FakeStartupDirectory {
    async fn startup(&self, id: StartupId) -> PlatformResult<Option<StartupRecord>> {
        Ok(self.startups.lock().unwrap().get(&id).cloned())
    }

    async fn refresh_enrichment(&self, _id: StartupId) -> PlatformResult<Enrichment> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .refresh_result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(rich_enrichment))
    }
}

pub struct FakeInvestorDirectory {
    investors: Mutex<Vec<InvestorRecord>>,
}

impl FakeInvestorDirectory {
    pub fn new(investors: Vec<InvestorRecord>) -> Self {
        Self {
            investors: Mutex::new(investors),
        }
    }
}

#[async_trait]
impl InvestorDirectory for FakeInvestorDirectory {
    async fn eligible_investors(&self) -> PlatformResult<Vec<InvestorRecord>> {
        Ok(self.investors.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingMatchWriter {
    writes: Mutex<Vec<(StartupId, Vec<RankedMatch>)>>,
}

impl RecordingMatchWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(StartupId, Vec<RankedMatch>)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MatchWriter for RecordingMatchWriter {
    async fn replace_suggested(
        &self,
        startup_id: StartupId,
        matches: &[RankedMatch],
    ) -> PlatformResult<usize> {
        self.writes
            .lock()
            .unwrap()
            .push((startup_id, matches.to_vec()));
        Ok(matches.len())
    }
}

#[derive(Default)]
pub struct FakeWatchlistDirectory {
    watched: Mutex<Vec<WatchedStartup>>,
}

impl FakeWatchlistDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, startup_id: StartupId, watchers: &[UserId]) {
        self.watched.lock().unwrap().push(WatchedStartup {
            startup_id,
            watcher_ids: watchers.to_vec(),
        });
    }
}

#[async_trait]
impl WatchlistDirectory for FakeWatchlistDirectory {
    async fn watched_startups(&self) -> PlatformResult<Vec<WatchedStartup>> {
        Ok(self.watched.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeRecipientDirectory {
    recipients: Mutex<HashMap<UserId, Recipient>>,
}

impl FakeRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, recipient: Recipient) {
        self.recipients
            .lock()
            .unwrap()
            .insert(recipient.user_id, recipient);
    }
}

#[async_trait]
impl RecipientDirectory for FakeRecipientDirectory {
    async fn recipient(&self, user_id: UserId) -> PlatformResult<Option<Recipient>> {
        Ok(self.recipients.lock().unwrap().get(&user_id).cloned())
    }

    async fn digest_recipients(&self) -> PlatformResult<Vec<Recipient>> {
        Ok(self
            .recipients
            .lock()
            .unwrap()
            .values()
            .filter(|recipient| recipient.digest_enabled)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeDigestSource {
    content: Mutex<HashMap<UserId, serde_json::Value>>,
    calls: Mutex<Vec<(UserId, Option<DateTime<Utc>>)>>,
}

impl FakeDigestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_content(&self, user_id: UserId, content: serde_json::Value) {
        self.content.lock().unwrap().insert(user_id, content);
    }

    pub fn calls(&self) -> Vec<(UserId, Option<DateTime<Utc>>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DigestSource for FakeDigestSource {
    async fn digest_content(
        &self,
        user_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Option<serde_json::Value>> {
        self.calls.lock().unwrap().push((user_id, since));
        Ok(self.content.lock().unwrap().get(&user_id).cloned())
    }
}

/// Transport whose next outcomes can be scripted; unscripted sends
/// succeed with a generated provider id.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Result<String, TransportError>>>,
    sent: Mutex<Vec<(UserId, NotificationId)>>,
    provider_seq: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failures(&self, count: usize) {
        let mut outcomes = self.outcomes.lock().unwrap();
        for _ in 0..count {
            outcomes.push_back(Err(TransportError::Unavailable(
                "provider 503".to_string(),
            )));
        }
    }

    pub fn push_success(&self, provider_id: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Ok(provider_id.to_string()));
    }

    pub fn sent(&self) -> Vec<(UserId, NotificationId)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn send(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<String, TransportError> {
        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(Err(error)) => Err(error),
            Some(Ok(provider_id)) => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((recipient.user_id, notification.id));
                Ok(provider_id)
            }
            None => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((recipient.user_id, notification.id));
                let seq = self.provider_seq.fetch_add(1, Ordering::SeqCst);
                Ok(format!("prov-{seq}"))
            }
        }
    }
}
