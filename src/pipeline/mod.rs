//! Pipeline execution with persisted step progress.
//!
//! The executor drives a claimed job through its kind's ordered step
//! list. Before entering a step it persists the progress marker and the
//! trace accumulated so far, so observers and any successor worker see
//! exactly where the job stands. Failure is terminal for the run: there
//! is no per-step retry, and re-enqueueing is an operator action.

mod matching;

pub use matching::{MATCH_STEPS, MatchPipeline, MatchPolicy, rank_candidates};

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{JobKind, JobRecord, JobStatus, JobStore, StoreResult, TraceEntry};

use matching::MatchRunState;

/// Unrecoverable problem inside a pipeline step.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct StepFailure {
    pub code: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// How one processing call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed { result_count: i32 },
    Failed { code: String },
    /// Another worker took the job over; nothing was written.
    LeaseLost,
}

/// Drives claimed jobs through their pipelines on behalf of one worker.
pub struct PipelineExecutor<S> {
    store: Arc<S>,
    worker_id: String,
    matching: MatchPipeline,
}

impl<S: JobStore> PipelineExecutor<S> {
    pub fn new(store: Arc<S>, worker_id: impl Into<String>, matching: MatchPipeline) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            matching,
        }
    }

    /// Process a job this worker currently holds the lease on.
    pub async fn process(&self, job: &JobRecord) -> StoreResult<ProcessOutcome> {
        match job.kind {
            JobKind::MatchGeneration => self.run_match_generation(job).await,
        }
    }

    async fn run_match_generation(&self, job: &JobRecord) -> StoreResult<ProcessOutcome> {
        // A takeover after expiry starts over but keeps the prior trace.
        let mut trace = job.debug_trace.clone();
        let mut state = MatchRunState::default();

        for step in MATCH_STEPS {
            let entered = self
                .store
                .record_step(job.id, &self.worker_id, step, &trace)
                .await?;
            if !entered {
                warn!(job_id = %job.id, step, "lost the lease before entering step");
                return Ok(ProcessOutcome::LeaseLost);
            }
            debug!(job_id = %job.id, step, "entering step");

            if let Err(failure) = self.matching.run_step(step, job, &mut state, &mut trace).await {
                trace.push(TraceEntry::new(
                    step,
                    serde_json::json!({
                        "error": failure.code.as_str(),
                        "message": failure.message.as_str(),
                    }),
                ));
                let recorded = self
                    .store
                    .fail_job(job.id, &self.worker_id, &failure.code, &failure.message, &trace)
                    .await?;
                if !recorded {
                    warn!(job_id = %job.id, step, "lost the lease while recording failure");
                    return Ok(ProcessOutcome::LeaseLost);
                }
                counter!("belay_jobs_failed_total").increment(1);
                info!(
                    job_id = %job.id,
                    step,
                    code = %failure.code,
                    "job failed"
                );
                return Ok(ProcessOutcome::Failed { code: failure.code });
            }
        }

        let result_count = state.persisted;
        let recorded = self
            .store
            .complete_job(job.id, &self.worker_id, result_count, JobStatus::Ready, &trace)
            .await?;
        if !recorded {
            warn!(job_id = %job.id, "lost the lease at completion");
            return Ok(ProcessOutcome::LeaseLost);
        }
        counter!("belay_jobs_completed_total").increment(1);
        info!(job_id = %job.id, result_count, "job completed");
        Ok(ProcessOutcome::Completed { result_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Enrichment;
    use crate::store::{JobKind, MemoryStore, StartupId};
    use crate::test_support::{
        FakeInvestorDirectory, FakeStartupDirectory, RecordingMatchWriter, investor,
        rich_enrichment, sample_startup,
    };

    fn executor_with(
        store: Arc<MemoryStore>,
        startups: Arc<FakeStartupDirectory>,
        investors: Vec<crate::platform::InvestorRecord>,
        writer: Arc<RecordingMatchWriter>,
    ) -> PipelineExecutor<MemoryStore> {
        let matching = MatchPipeline::new(
            startups,
            Arc::new(FakeInvestorDirectory::new(investors)),
            writer,
            MatchPolicy::default(),
        );
        PipelineExecutor::new(store, "worker-a", matching)
    }

    async fn claimed_job(store: &MemoryStore, startup_id: StartupId) -> crate::store::JobRecord {
        let job = store
            .enqueue_job(JobKind::MatchGeneration, startup_id)
            .await
            .unwrap();
        assert!(store.try_acquire(job.id, "worker-a", 60).await.unwrap());
        store.get_job(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn missing_startup_fails_with_subject_not_found() {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let writer = Arc::new(RecordingMatchWriter::new());
        let executor = executor_with(store.clone(), startups, vec![], writer.clone());

        let job = claimed_job(&store, StartupId::new()).await;
        let outcome = executor.process(&job).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                code: "SUBJECT_NOT_FOUND".to_string()
            }
        );

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("SUBJECT_NOT_FOUND"));
        assert!(stored.completed_at.is_some());
        assert!(writer.writes().is_empty());
    }

    #[tokio::test]
    async fn rich_enrichment_skips_refresh() {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let mut startup = sample_startup("Loopwire", &["fintech"], 40.0);
        startup.enrichment = Some(rich_enrichment());
        let startup_id = startup.id;
        startups.add(startup);

        let writer = Arc::new(RecordingMatchWriter::new());
        let executor = executor_with(store.clone(), startups.clone(), vec![], writer);

        let job = claimed_job(&store, startup_id).await;
        let outcome = executor.process(&job).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed { result_count: 0 });
        assert_eq!(startups.refresh_calls(), 0);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        let extract = stored
            .debug_trace
            .iter()
            .find(|entry| entry.step == "extract")
            .expect("extract trace entry");
        assert_eq!(extract.detail["source"], "cached");
    }

    #[tokio::test]
    async fn missing_enrichment_triggers_refresh() {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let startup = sample_startup("Loopwire", &["fintech"], 40.0);
        let startup_id = startup.id;
        startups.add(startup);
        startups.set_refresh_result(Enrichment {
            summary: Some("freight payments".to_string()),
            website: Some("https://loopwire.example.com".to_string()),
            ..Enrichment::default()
        });

        let writer = Arc::new(RecordingMatchWriter::new());
        let executor = executor_with(store.clone(), startups.clone(), vec![], writer);

        let job = claimed_job(&store, startup_id).await;
        let outcome = executor.process(&job).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed { result_count: 0 });
        assert_eq!(startups.refresh_calls(), 1);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        let extract = stored
            .debug_trace
            .iter()
            .find(|entry| entry.step == "extract")
            .expect("extract trace entry");
        assert_eq!(extract.detail["source"], "refreshed");
        assert_eq!(extract.detail["populated_fields"], 2);
    }

    #[tokio::test]
    async fn placeholder_name_fails_parse() {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let mut startup = sample_startup("Untitled", &["fintech"], 40.0);
        startup.enrichment = Some(rich_enrichment());
        let startup_id = startup.id;
        startups.add(startup);

        let writer = Arc::new(RecordingMatchWriter::new());
        let executor = executor_with(store.clone(), startups, vec![], writer);

        let job = claimed_job(&store, startup_id).await;
        let outcome = executor.process(&job).await.unwrap();
        let ProcessOutcome::Failed { code } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(code, "PARSE_FAILED");

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert!(
            stored
                .error_message
                .as_deref()
                .unwrap()
                .contains("placeholder name")
        );
        assert_eq!(stored.progress_step.as_deref(), Some("parse"));
    }

    #[tokio::test]
    async fn completed_run_persists_ranked_matches() {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let mut startup = sample_startup("Loopwire", &["fintech"], 40.0);
        startup.enrichment = Some(rich_enrichment());
        let startup_id = startup.id;
        startups.add(startup);

        // Overlap bonus 10 plus quality 10 on top of base: 75 kept, 50 dropped.
        let investors = vec![
            investor("Alder Capital", 55.0, &["fintech"]),
            investor("Birch Partners", 30.0, &["fintech"]),
        ];
        let writer = Arc::new(RecordingMatchWriter::new());
        let executor = executor_with(store.clone(), startups, investors, writer.clone());

        let job = claimed_job(&store, startup_id).await;
        let outcome = executor.process(&job).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed { result_count: 1 });

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ready);
        assert_eq!(stored.result_count, Some(1));
        assert_eq!(stored.progress_step.as_deref(), Some("finalize"));
        let steps: Vec<&str> = stored
            .debug_trace
            .iter()
            .map(|entry| entry.step.as_str())
            .collect();
        assert_eq!(
            steps,
            vec!["resolve", "extract", "parse", "match", "rank", "finalize"]
        );

        let writes = writer.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, startup_id);
        assert_eq!(writes[0].1.len(), 1);
        assert!((writes[0].1[0].score - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn losing_worker_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let startups = Arc::new(FakeStartupDirectory::new());
        let mut startup = sample_startup("Loopwire", &["fintech"], 40.0);
        startup.enrichment = Some(rich_enrichment());
        let startup_id = startup.id;
        startups.add(startup);

        let writer = Arc::new(RecordingMatchWriter::new());
        let executor = executor_with(store.clone(), startups, vec![], writer);

        let job = store
            .enqueue_job(JobKind::MatchGeneration, startup_id)
            .await
            .unwrap();
        // worker-a's lease expires immediately; worker-b takes over.
        assert!(store.try_acquire(job.id, "worker-a", -5).await.unwrap());
        let snapshot = store.get_job(job.id).await.unwrap().unwrap();
        assert!(store.try_acquire(job.id, "worker-b", 60).await.unwrap());

        let outcome = executor.process(&snapshot).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::LeaseLost);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.lock_owner.as_deref(), Some("worker-b"));
        assert!(stored.progress_step.is_none());
    }
}
