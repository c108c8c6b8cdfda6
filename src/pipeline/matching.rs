//! Steps and scoring policy for match-generation jobs.

use std::sync::Arc;

use serde_json::json;

use crate::platform::{
    InvestorDirectory, InvestorRecord, MatchWriter, RankedMatch, StartupDirectory, StartupRecord,
};
use crate::store::{JobRecord, TraceEntry};

use super::StepFailure;

/// Ordered step names for a match-generation run.
pub const MATCH_STEPS: [&str; 6] = ["resolve", "extract", "parse", "match", "rank", "finalize"];

/// Profiles below this quality are not worth matching.
pub const MIN_QUALITY_SCORE: f64 = 20.0;

const PLACEHOLDER_NAMES: [&str; 3] = ["untitled", "unknown", "n/a"];

/// Scoring weights and the acceptance threshold for suggested matches.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    pub category_overlap_bonus: f64,
    pub stage_match_bonus: f64,
    pub quality_weight: f64,
    /// Minimum score, inclusive, for a candidate to be suggested.
    pub acceptance_threshold: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            category_overlap_bonus: 10.0,
            stage_match_bonus: 15.0,
            quality_weight: 0.25,
            acceptance_threshold: 70.0,
        }
    }
}

impl MatchPolicy {
    /// Score one startup/investor pairing.
    pub fn score(&self, startup: &StartupRecord, investor: &InvestorRecord) -> f64 {
        let overlap = category_overlap(&startup.categories, &investor.categories) as f64;
        let stage = if stage_matches(startup.stage.as_deref(), &investor.preferred_stages) {
            1.0
        } else {
            0.0
        };
        investor.base_score
            + self.category_overlap_bonus * overlap
            + self.stage_match_bonus * stage
            + self.quality_weight * startup.quality_score
    }
}

/// Candidates scoring at or above the threshold, highest first.
pub fn rank_candidates(
    policy: &MatchPolicy,
    startup: &StartupRecord,
    candidates: &[InvestorRecord],
) -> Vec<RankedMatch> {
    let mut ranked: Vec<RankedMatch> = candidates
        .iter()
        .map(|investor| RankedMatch {
            investor_id: investor.id,
            score: policy.score(startup, investor),
        })
        .filter(|candidate| candidate.score >= policy.acceptance_threshold)
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

fn category_overlap(startup: &[String], investor: &[String]) -> usize {
    investor
        .iter()
        .filter(|tag| startup.iter().any(|own| own.eq_ignore_ascii_case(tag)))
        .count()
}

fn stage_matches(stage: Option<&str>, preferred: &[String]) -> bool {
    stage.is_some_and(|own| preferred.iter().any(|wanted| wanted.eq_ignore_ascii_case(own)))
}

fn parse_violations(startup: &StartupRecord) -> Vec<&'static str> {
    let mut violations = Vec::new();
    let name = startup.name.trim();
    if name.is_empty()
        || PLACEHOLDER_NAMES
            .iter()
            .any(|placeholder| name.eq_ignore_ascii_case(placeholder))
    {
        violations.push("placeholder name");
    }
    if startup.categories.is_empty() {
        violations.push("no category tags");
    }
    if startup.quality_score < MIN_QUALITY_SCORE {
        violations.push("quality score below minimum");
    }
    violations
}

/// State carried across the steps of one match-generation run.
#[derive(Default)]
pub(crate) struct MatchRunState {
    startup: Option<StartupRecord>,
    candidates: Vec<InvestorRecord>,
    ranked: Vec<RankedMatch>,
    pub(crate) persisted: i32,
}

fn missing_state(step: &str) -> StepFailure {
    StepFailure::new("INTERNAL", format!("no resolved startup at step {step}"))
}

/// The match-generation pipeline and its collaborators.
pub struct MatchPipeline {
    startups: Arc<dyn StartupDirectory>,
    investors: Arc<dyn InvestorDirectory>,
    writer: Arc<dyn MatchWriter>,
    policy: MatchPolicy,
}

impl MatchPipeline {
    pub fn new(
        startups: Arc<dyn StartupDirectory>,
        investors: Arc<dyn InvestorDirectory>,
        writer: Arc<dyn MatchWriter>,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            startups,
            investors,
            writer,
            policy,
        }
    }

    pub(crate) async fn run_step(
        &self,
        step: &str,
        job: &JobRecord,
        state: &mut MatchRunState,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<(), StepFailure> {
        match step {
            "resolve" => self.resolve(job, state, trace).await,
            "extract" => self.extract(state, trace).await,
            "parse" => self.parse(state, trace),
            "match" => self.match_candidates(state, trace).await,
            "rank" => self.rank(state, trace),
            "finalize" => self.finalize(job, state, trace).await,
            other => Err(StepFailure::new(
                "INTERNAL",
                format!("unknown step {other}"),
            )),
        }
    }

    async fn resolve(
        &self,
        job: &JobRecord,
        state: &mut MatchRunState,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<(), StepFailure> {
        let startup = self
            .startups
            .startup(job.startup_id)
            .await
            .map_err(|error| StepFailure::new("DIRECTORY_UNAVAILABLE", error.to_string()))?
            .ok_or_else(|| {
                StepFailure::new(
                    "SUBJECT_NOT_FOUND",
                    format!("startup {} is not in the directory", job.startup_id),
                )
            })?;
        trace.push(TraceEntry::new(
            "resolve",
            json!({
                "name": startup.name.as_str(),
                "categories": startup.categories.len(),
            }),
        ));
        state.startup = Some(startup);
        Ok(())
    }

    async fn extract(
        &self,
        state: &mut MatchRunState,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<(), StepFailure> {
        let Some(startup) = state.startup.as_mut() else {
            return Err(missing_state("extract"));
        };
        match &startup.enrichment {
            // Rich cached enrichment makes the expensive refresh redundant.
            Some(enrichment) if enrichment.is_rich() => {
                trace.push(TraceEntry::new(
                    "extract",
                    json!({
                        "source": "cached",
                        "populated_fields": enrichment.populated_fields(),
                    }),
                ));
            }
            _ => {
                let refreshed = self
                    .startups
                    .refresh_enrichment(startup.id)
                    .await
                    .map_err(|error| StepFailure::new("ENRICHMENT_FAILED", error.to_string()))?;
                trace.push(TraceEntry::new(
                    "extract",
                    json!({
                        "source": "refreshed",
                        "populated_fields": refreshed.populated_fields(),
                    }),
                ));
                startup.enrichment = Some(refreshed);
            }
        }
        Ok(())
    }

    fn parse(&self, state: &MatchRunState, trace: &mut Vec<TraceEntry>) -> Result<(), StepFailure> {
        let Some(startup) = state.startup.as_ref() else {
            return Err(missing_state("parse"));
        };
        let violations = parse_violations(startup);
        if !violations.is_empty() {
            return Err(StepFailure::new("PARSE_FAILED", violations.join("; ")));
        }
        trace.push(TraceEntry::new("parse", json!({ "checks": "passed" })));
        Ok(())
    }

    async fn match_candidates(
        &self,
        state: &mut MatchRunState,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<(), StepFailure> {
        let Some(startup) = state.startup.as_ref() else {
            return Err(missing_state("match"));
        };
        let eligible = self
            .investors
            .eligible_investors()
            .await
            .map_err(|error| StepFailure::new("INVESTOR_LOOKUP_FAILED", error.to_string()))?;
        let eligible_count = eligible.len();
        // Zero matches is an empty candidate set, not an error.
        let candidates: Vec<InvestorRecord> = eligible
            .into_iter()
            .filter(|investor| category_overlap(&startup.categories, &investor.categories) > 0)
            .collect();
        trace.push(TraceEntry::new(
            "match",
            json!({
                "eligible": eligible_count,
                "matched": candidates.len(),
            }),
        ));
        state.candidates = candidates;
        Ok(())
    }

    fn rank(
        &self,
        state: &mut MatchRunState,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<(), StepFailure> {
        let ranked = {
            let Some(startup) = state.startup.as_ref() else {
                return Err(missing_state("rank"));
            };
            rank_candidates(&self.policy, startup, &state.candidates)
        };
        trace.push(TraceEntry::new(
            "rank",
            json!({
                "candidates": state.candidates.len(),
                "kept": ranked.len(),
                "threshold": self.policy.acceptance_threshold,
            }),
        ));
        state.ranked = ranked;
        Ok(())
    }

    async fn finalize(
        &self,
        job: &JobRecord,
        state: &mut MatchRunState,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<(), StepFailure> {
        let persisted = self
            .writer
            .replace_suggested(job.startup_id, &state.ranked)
            .await
            .map_err(|error| StepFailure::new("MATCH_WRITE_FAILED", error.to_string()))?;
        // Report what actually landed, not what was attempted.
        trace.push(TraceEntry::new(
            "finalize",
            json!({
                "attempted": state.ranked.len(),
                "persisted": persisted,
            }),
        ));
        state.persisted = persisted as i32;
        Ok(())
    }
}
