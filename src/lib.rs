//! Belay - lease-based job claiming and match pipeline execution.

pub mod config;
pub mod delivery;
pub mod digest;
pub mod lease;
pub mod pipeline;
pub mod platform;
pub mod scheduler;
pub mod store;
pub mod sweep;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use delivery::{DeliveryEngine, DeliveryOutcome, DeliveryReport};
pub use digest::DigestSweep;
pub use lease::LeaseKeeper;
pub use pipeline::{MatchPipeline, MatchPolicy, PipelineExecutor, ProcessOutcome};
pub use scheduler::{SchedulerTask, spawn_scheduler};
pub use store::{
    JobId, JobKind, JobRecord, JobStatus, MemoryStore, PostgresStore, StoreError, StoreResult,
};
pub use sweep::{AlertSweep, SweepOutcome};
pub use worker::{Worker, spawn_worker};
