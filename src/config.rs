//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `BELAY_DATABASE_URL`: PostgreSQL connection string (required)
//! - `BELAY_WORKER_ID`: Identity stamped into `lock_owner` (default: generated `belay-<uuid>`)
//! - `BELAY_LEASE_SECONDS`: Job lease duration (default: 60)
//! - `BELAY_RENEW_INTERVAL_MS`: Lease renewal cadence (default: 30000, 50% of the lease)
//! - `BELAY_POLL_INTERVAL_MS`: Worker poll interval when idle (default: 5000)
//! - `BELAY_ERROR_BACKOFF_MS`: Pause after a processing error (default: 5000)
//! - `BELAY_ALERT_SWEEP_INTERVAL_MS`: Momentum alert sweep cadence (default: 300000)
//! - `BELAY_DIGEST_SWEEP_INTERVAL_MS`: Digest sweep cadence (default: 3600000)
//! - `BELAY_DELIVERY_RUN_INTERVAL_MS`: Delivery run cadence (default: 60000)
//! - `BELAY_DELIVERY_BATCH_SIZE`: Notifications fetched per delivery run (default: 50)
//! - `BELAY_DAILY_SEND_CAP`: Max sends per user per rolling 24h (default: 10)
//! - `BELAY_BREAKER_THRESHOLD`: Consecutive send failures before aborting a run (default: 5)
//! - `BELAY_SEND_DELAY_MS`: Pause between delivery items (default: 200)
//! - `BELAY_BATCH_LOCK_STALE_SECONDS`: Age at which a held batch lock may be taken over (default: 600)

use std::env;

use anyhow::{Context, Result};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Identity stamped into `lock_owner` and `claimed_by`; unique per process
    pub worker_id: String,

    /// Job lease duration in seconds
    pub lease_seconds: i64,

    /// Lease renewal cadence (milliseconds)
    pub renew_interval_ms: u64,

    /// Worker poll interval when no job is claimable (milliseconds)
    pub poll_interval_ms: u64,

    /// Pause after an error escapes job processing (milliseconds)
    pub error_backoff_ms: u64,

    /// Momentum alert sweep cadence (milliseconds)
    pub alert_sweep_interval_ms: u64,

    /// Digest sweep cadence (milliseconds)
    pub digest_sweep_interval_ms: u64,

    /// Delivery run cadence (milliseconds)
    pub delivery_run_interval_ms: u64,

    /// Notifications fetched per delivery run
    pub delivery_batch_size: i64,

    /// Maximum sends per user per rolling 24 hours
    pub daily_send_cap: i64,

    /// Consecutive send failures that abort the rest of a delivery run
    pub breaker_threshold: u32,

    /// Pause between delivery items (milliseconds)
    pub send_delay_ms: u64,

    /// Age at which a held batch lock is considered abandoned (seconds)
    pub batch_lock_stale_seconds: u64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let database_url = env::var("BELAY_DATABASE_URL")
            .context("BELAY_DATABASE_URL environment variable is required")?;

        let worker_id = env::var("BELAY_WORKER_ID")
            .unwrap_or_else(|_| format!("belay-{}", uuid::Uuid::new_v4()));

        let lease_seconds = env::var("BELAY_LEASE_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let renew_interval_ms = env::var("BELAY_RENEW_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000);

        let poll_interval_ms = env::var("BELAY_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let error_backoff_ms = env::var("BELAY_ERROR_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let alert_sweep_interval_ms = env::var("BELAY_ALERT_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300_000);

        let digest_sweep_interval_ms = env::var("BELAY_DIGEST_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3_600_000);

        let delivery_run_interval_ms = env::var("BELAY_DELIVERY_RUN_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        let delivery_batch_size = env::var("BELAY_DELIVERY_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        let daily_send_cap = env::var("BELAY_DAILY_SEND_CAP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let breaker_threshold = env::var("BELAY_BREAKER_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let send_delay_ms = env::var("BELAY_SEND_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);

        let batch_lock_stale_seconds = env::var("BELAY_BATCH_LOCK_STALE_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);

        Ok(Self {
            database_url,
            worker_id,
            lease_seconds,
            renew_interval_ms,
            poll_interval_ms,
            error_backoff_ms,
            alert_sweep_interval_ms,
            digest_sweep_interval_ms,
            delivery_run_interval_ms,
            delivery_batch_size,
            daily_send_cap,
            breaker_threshold,
            send_delay_ms,
            batch_lock_stale_seconds,
        })
    }

    /// Create a test configuration with fast intervals
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            worker_id: "test-worker".to_string(),
            lease_seconds: 60,
            renew_interval_ms: 50,
            poll_interval_ms: 20,
            error_backoff_ms: 20,
            alert_sweep_interval_ms: 50,
            digest_sweep_interval_ms: 50,
            delivery_run_interval_ms: 50,
            delivery_batch_size: 50,
            daily_send_cap: 10,
            breaker_threshold: 5,
            send_delay_ms: 0,
            batch_lock_stale_seconds: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_config_defaults() {
        let config = Config::test_config("postgres://test");
        assert_eq!(config.database_url, "postgres://test");
        assert_eq!(config.lease_seconds, 60);
        assert_eq!(config.daily_send_cap, 10);
        assert_eq!(config.breaker_threshold, 5);
    }

    #[test]
    fn test_renewal_is_half_of_lease() {
        // Default renewal (30s) must stay well inside the default lease (60s)
        // or a busy step could lose its claim mid-run.
        let config = Config::test_config("postgres://test");
        assert!(config.renew_interval_ms < (config.lease_seconds as u64) * 1000);
    }
}
