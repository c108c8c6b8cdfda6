//! Engine worker process.
//!
//! Runs the job worker and the periodic scheduler against Postgres.
//! Production deployments provide the platform collaborators
//! (directories, match writer, delivery transport); a standalone run
//! wires them from an optional JSON seed file instead, with a transport
//! that logs instead of sending, so the whole engine can be exercised
//! against nothing but a database.
//!
//! Extra environment variables beyond `Config`:
//! - `BELAY_SEED_FILE`: path to a JSON seed describing startups,
//!   investors, watchlists, and recipients (optional; empty platform
//!   without it)

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use belay::config::Config;
use belay::delivery::DeliveryEngine;
use belay::digest::DigestSweep;
use belay::pipeline::{MatchPipeline, MatchPolicy};
use belay::platform::{
    DeliveryTransport, DigestSource, Enrichment, InvestorDirectory, InvestorId, InvestorRecord,
    MatchWriter, PlatformResult, RankedMatch, Recipient, RecipientDirectory, StartupDirectory,
    StartupRecord, TransportError, WatchedStartup, WatchlistDirectory,
};
use belay::scheduler::spawn_scheduler;
use belay::store::{JobKind, JobStore, Notification, PostgresStore, StartupId, UserId};
use belay::sweep::AlertSweep;
use belay::worker::spawn_worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting belay worker");

    let config = Config::from_env()?;
    info!(worker_id = %config.worker_id, "loaded configuration");

    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
    info!("database ready");

    let seed = match std::env::var("BELAY_SEED_FILE") {
        Ok(path) => load_seed(&path)?,
        Err(_) => SeedFile::default(),
    };
    let enqueue_seeded = seed.enqueue;
    let platform = Arc::new(StaticPlatform::from_seed(seed));
    info!(
        startups = platform.startups.len(),
        investors = platform.investors.len(),
        recipients = platform.recipients.len(),
        "platform wiring ready"
    );

    if enqueue_seeded {
        for startup_id in platform.startups.keys() {
            let job = store
                .enqueue_job(JobKind::MatchGeneration, *startup_id)
                .await?;
            info!(job_id = %job.id, startup_id = %startup_id, "enqueued seeded job");
        }
    }

    let matching = MatchPipeline::new(
        platform.clone(),
        platform.clone(),
        Arc::new(LoggingMatchWriter),
        MatchPolicy::default(),
    );
    let (worker_handle, worker_shutdown) = spawn_worker(store.clone(), matching, &config);

    let alert_sweep = AlertSweep::new(store.clone(), platform.clone(), platform.clone(), &config);
    let digest_sweep = DigestSweep::new(store.clone(), platform.clone(), platform.clone(), &config);
    let delivery = DeliveryEngine::new(
        store.clone(),
        platform.clone(),
        Arc::new(LoggingTransport),
        &config,
    );
    let (scheduler_handle, scheduler_shutdown) =
        spawn_scheduler(alert_sweep, digest_sweep, delivery, &config);

    info!("belay worker started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    worker_shutdown.send(true).ok();
    scheduler_shutdown.send(true).ok();
    worker_handle.await?;
    scheduler_handle.await?;

    Ok(())
}

fn load_seed(path: &str) -> Result<SeedFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing seed file {path}"))
}

// ============================================================================
// Seed file
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct SeedFile {
    #[serde(default)]
    startups: Vec<SeedStartup>,
    #[serde(default)]
    investors: Vec<SeedInvestor>,
    #[serde(default)]
    watchlists: Vec<SeedWatchlist>,
    #[serde(default)]
    recipients: Vec<SeedRecipient>,
    /// Enqueue one match job per seeded startup at boot.
    #[serde(default)]
    enqueue: bool,
}

#[derive(Debug, Deserialize)]
struct SeedStartup {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    name: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    quality_score: f64,
    #[serde(default)]
    momentum: Option<f64>,
    #[serde(default)]
    enrichment: Option<SeedEnrichment>,
}

#[derive(Debug, Default, Deserialize)]
struct SeedEnrichment {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    team_size: Option<i32>,
    #[serde(default)]
    funding_raised: Option<f64>,
    #[serde(default)]
    tech_stack: Option<Vec<String>>,
}

impl SeedEnrichment {
    fn into_enrichment(self) -> Enrichment {
        Enrichment {
            summary: self.summary,
            website: self.website,
            team_size: self.team_size,
            funding_raised: self.funding_raised,
            tech_stack: self.tech_stack,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SeedInvestor {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    name: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    preferred_stages: Vec<String>,
    #[serde(default)]
    base_score: f64,
}

#[derive(Debug, Deserialize)]
struct SeedWatchlist {
    startup_id: Uuid,
    #[serde(default)]
    watchers: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct SeedRecipient {
    user_id: Uuid,
    address: String,
    #[serde(default = "default_true")]
    subscribed: bool,
    #[serde(default)]
    digest_enabled: bool,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Harness collaborators
// ============================================================================

/// Static platform view built from the seed file.
struct StaticPlatform {
    startups: HashMap<StartupId, StartupRecord>,
    investors: Vec<InvestorRecord>,
    watched: Vec<WatchedStartup>,
    recipients: HashMap<UserId, Recipient>,
}

impl StaticPlatform {
    fn from_seed(seed: SeedFile) -> Self {
        let startups = seed
            .startups
            .into_iter()
            .map(|s| {
                let id = StartupId(s.id);
                let record = StartupRecord {
                    id,
                    name: s.name,
                    categories: s.categories,
                    stage: s.stage,
                    quality_score: s.quality_score,
                    momentum: s.momentum,
                    enrichment: s.enrichment.map(SeedEnrichment::into_enrichment),
                };
                (id, record)
            })
            .collect();
        let investors = seed
            .investors
            .into_iter()
            .map(|i| InvestorRecord {
                id: InvestorId(i.id),
                name: i.name,
                categories: i.categories,
                preferred_stages: i.preferred_stages,
                base_score: i.base_score,
            })
            .collect();
        let watched = seed
            .watchlists
            .into_iter()
            .map(|w| WatchedStartup {
                startup_id: StartupId(w.startup_id),
                watcher_ids: w.watchers.into_iter().map(UserId).collect(),
            })
            .collect();
        let recipients = seed
            .recipients
            .into_iter()
            .map(|r| {
                let user_id = UserId(r.user_id);
                let recipient = Recipient {
                    user_id,
                    address: r.address,
                    subscribed: r.subscribed,
                    digest_enabled: r.digest_enabled,
                };
                (user_id, recipient)
            })
            .collect();
        Self {
            startups,
            investors,
            watched,
            recipients,
        }
    }
}

#[async_trait]
impl StartupDirectory for StaticPlatform {
    async fn startup(&self, id: StartupId) -> PlatformResult<Option<StartupRecord>> {
        Ok(self.startups.get(&id).cloned())
    }

    async fn refresh_enrichment(&self, id: StartupId) -> PlatformResult<Enrichment> {
        Ok(self
            .startups
            .get(&id)
            .and_then(|s| s.enrichment.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl InvestorDirectory for StaticPlatform {
    async fn eligible_investors(&self) -> PlatformResult<Vec<InvestorRecord>> {
        Ok(self.investors.clone())
    }
}

#[async_trait]
impl WatchlistDirectory for StaticPlatform {
    async fn watched_startups(&self) -> PlatformResult<Vec<WatchedStartup>> {
        Ok(self.watched.clone())
    }
}

#[async_trait]
impl RecipientDirectory for StaticPlatform {
    async fn recipient(&self, user_id: UserId) -> PlatformResult<Option<Recipient>> {
        Ok(self.recipients.get(&user_id).cloned())
    }

    async fn digest_recipients(&self) -> PlatformResult<Vec<Recipient>> {
        Ok(self
            .recipients
            .values()
            .filter(|recipient| recipient.digest_enabled)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DigestSource for StaticPlatform {
    async fn digest_content(
        &self,
        _user_id: UserId,
        _since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Option<serde_json::Value>> {
        // Standalone runs have no digest content source.
        Ok(None)
    }
}

/// Logs what would be persisted instead of writing platform tables.
struct LoggingMatchWriter;

#[async_trait]
impl MatchWriter for LoggingMatchWriter {
    async fn replace_suggested(
        &self,
        startup_id: StartupId,
        matches: &[RankedMatch],
    ) -> PlatformResult<usize> {
        for m in matches {
            info!(
                startup_id = %startup_id,
                investor_id = %m.investor_id,
                score = m.score,
                "match suggested (log only)"
            );
        }
        Ok(matches.len())
    }
}

/// Logs notifications instead of calling a provider.
struct LoggingTransport;

#[async_trait]
impl DeliveryTransport for LoggingTransport {
    async fn send(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<String, TransportError> {
        info!(
            user_id = %recipient.user_id,
            address = %recipient.address,
            kind = notification.kind.as_str(),
            "notification delivered (log only)"
        );
        Ok(format!("log-{}", Uuid::new_v4()))
    }
}
