//! In-memory implementation of every storage trait.
//!
//! Mirrors the PostgreSQL semantics the engines rely on: keyset pagination by
//! claim id, wrapping `sample_key` ranges, insert-if-absent on canonical
//! pairs, single-transaction batch commits and the single-active-run rule.
//! Enabled with the `mock` feature. Failures and read latency can be
//! injected to exercise the engines' error and deadline paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::*;
use crate::uuid_utils::{created_before, new_v7};

#[derive(Default)]
struct State {
    claims: BTreeMap<ClaimId, ClaimEmbedding>,
    by_sample_key: BTreeMap<(u64, ClaimId), ClaimId>,
    next_claim_id: ClaimId,
    observations: Vec<SimilarityObservation>,
    snapshot: Option<DistributionSnapshot>,
    candidates: BTreeMap<CanonicalPair, CandidatePair>,
    candidate_keys: HashMap<Uuid, CanonicalPair>,
    claimed_at: HashMap<Uuid, DateTime<Utc>>,
    runs: Vec<MiningProgress>,
    fail_next_commit: bool,
    read_latency: Duration,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    rng: Arc<Mutex<StdRng>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store with entropy-seeded sample keys.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create an empty store whose sample keys are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_claim_id: 1,
                ..Default::default()
            })),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("in-memory store lock poisoned".into()))
    }

    /// Make the next `commit_batch` fail before writing anything.
    pub fn fail_next_commit(&self) -> Result<()> {
        self.lock()?.fail_next_commit = true;
        Ok(())
    }

    /// Delay every sampling and observation read by `latency`.
    pub fn set_read_latency(&self, latency: Duration) -> Result<()> {
        self.lock()?.read_latency = latency;
        Ok(())
    }

    async fn simulate_read(&self) -> Result<()> {
        let latency = self.lock()?.read_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    /// Insert a claim with an explicit sample key.
    pub fn insert_claim_with_key(&self, claim: NewClaim, sample_key: f64) -> Result<ClaimId> {
        if !(0.0..1.0).contains(&sample_key) {
            return Err(Error::InvalidInput(format!(
                "sample key {sample_key} outside [0, 1)"
            )));
        }
        let mut state = self.lock()?;
        let id = state.next_claim_id;
        state.next_claim_id += 1;
        state.by_sample_key.insert((sample_key.to_bits(), id), id);
        state.claims.insert(
            id,
            ClaimEmbedding {
                id,
                document_id: claim.document_id,
                vector: claim.vector,
                sample_key,
            },
        );
        Ok(id)
    }

    /// Every stored candidate pair, in canonical order.
    pub fn all_candidates(&self) -> Result<Vec<CandidatePair>> {
        Ok(self.lock()?.candidates.values().cloned().collect())
    }

    /// Every stored observation.
    pub fn all_observations(&self) -> Result<Vec<SimilarityObservation>> {
        Ok(self
            .lock()?
            .observations
            .iter()
            .cloned()
            .collect())
    }

    /// Directly score a pair, bypassing the evaluation queue.
    pub fn set_score(&self, id: Uuid, score: f64) -> Result<()> {
        let mut state = self.lock()?;
        let pair = candidate_mut(&mut state, id)?;
        pair.status = EvaluationStatus::Completed;
        pair.score = Some(score);
        pair.quality_tier = QualityTier::from_score(score);
        pair.evaluated_at = Some(Utc::now());
        Ok(())
    }
}

fn candidate_mut(state: &mut State, id: Uuid) -> Result<&mut CandidatePair> {
    let key = *state
        .candidate_keys
        .get(&id)
        .ok_or_else(|| Error::NotFound(format!("candidate pair {id}")))?;
    state
        .candidates
        .get_mut(&key)
        .ok_or_else(|| Error::NotFound(format!("candidate pair {id}")))
}

fn run_mut(state: &mut State, id: Uuid) -> Result<&mut MiningProgress> {
    state
        .runs
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or(Error::RunNotFound(id))
}

fn apply_advance(state: &mut State, advance: ProgressAdvance) -> Result<MiningProgress> {
    let run = run_mut(state, advance.run_id)?;
    if run.status != RunStatus::InProgress {
        return Err(Error::InvalidState(format!(
            "run {} is {}, not in_progress",
            run.id, run.status
        )));
    }
    run.last_source_id = run.last_source_id.max(advance.cursor);
    run.sources_processed += advance.sources_processed;
    run.pairs_inserted += advance.pairs_inserted;
    run.batches += 1;
    run.consecutive_failures = 0;
    run.last_error = None;
    run.updated_at = Utc::now();
    Ok(run.clone())
}

fn transition(
    state: &mut State,
    id: Uuid,
    to: RunStatus,
    reason: Option<&str>,
) -> Result<MiningProgress> {
    let run = run_mut(state, id)?;
    if run.status != RunStatus::InProgress {
        return Err(Error::InvalidState(format!(
            "cannot move run {} from {} to {}",
            run.id, run.status, to
        )));
    }
    let now = Utc::now();
    run.status = to;
    run.updated_at = now;
    run.finished_at = Some(now);
    if let Some(reason) = reason {
        run.last_error = Some(reason.to_string());
    }
    Ok(run.clone())
}

#[async_trait]
impl ClaimCorpus for InMemoryStore {
    async fn insert_claim(&self, claim: NewClaim) -> Result<ClaimId> {
        let key = self
            .rng
            .lock()
            .map_err(|_| Error::Internal("in-memory rng lock poisoned".into()))?
            .gen::<f64>();
        self.insert_claim_with_key(claim, key)
    }

    async fn claim_count(&self) -> Result<i64> {
        Ok(self.lock()?.claims.len() as i64)
    }

    async fn max_claim_id(&self) -> Result<Option<ClaimId>> {
        Ok(self.lock()?.claims.keys().next_back().copied())
    }

    async fn next_sources(&self, after: ClaimId, limit: i64) -> Result<Vec<ClaimEmbedding>> {
        let state = self.lock()?;
        Ok(state
            .claims
            .range((after.saturating_add(1))..)
            .take(limit.max(0) as usize)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn sample_range(&self, start: f64, limit: i64) -> Result<Vec<ClaimEmbedding>> {
        self.simulate_read().await?;
        let state = self.lock()?;
        let limit = limit.max(0) as usize;
        let start = if start > 0.0 { start.min(1.0) } else { 0.0 };
        let pivot = (start.to_bits(), ClaimId::MIN);
        let ids = state
            .by_sample_key
            .range(pivot..)
            .chain(state.by_sample_key.range(..pivot))
            .take(limit)
            .map(|(_, id)| *id);
        Ok(ids.filter_map(|id| state.claims.get(&id).cloned()).collect())
    }
}

#[async_trait]
impl ObservationRepository for InMemoryStore {
    async fn insert_observations(&self, observations: &[SimilarityObservation]) -> Result<u64> {
        self.lock()?
            .observations
            .extend(observations.iter().cloned());
        Ok(observations.len() as u64)
    }

    async fn latest_observation_run(&self) -> Result<Option<Uuid>> {
        Ok(self
            .lock()?
            .observations
            .iter()
            .map(|o| o.run_id)
            .max())
    }

    async fn observation_values(&self, run_id: Uuid, cap: i64) -> Result<Vec<f64>> {
        self.simulate_read().await?;
        Ok(self
            .lock()?
            .observations
            .iter()
            .filter(|o| o.run_id == run_id)
            .take(cap.max(0) as usize)
            .map(|o| o.similarity as f64)
            .collect())
    }

    async fn observation_count(&self, run_id: Uuid) -> Result<i64> {
        Ok(self
            .lock()?
            .observations
            .iter()
            .filter(|o| o.run_id == run_id)
            .count() as i64)
    }

    async fn purge_observations(
        &self,
        cutoff: DateTime<Utc>,
        keep_run: Option<Uuid>,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let before = state.observations.len();
        state
            .observations
            .retain(|o| Some(o.run_id) == keep_run || !created_before(&o.run_id, &cutoff));
        Ok((before - state.observations.len()) as u64)
    }
}

#[async_trait]
impl DistributionRepository for InMemoryStore {
    async fn upsert_snapshot(&self, snapshot: &DistributionSnapshot) -> Result<()> {
        self.lock()?.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn current_snapshot(&self) -> Result<Option<DistributionSnapshot>> {
        Ok(self.lock()?.snapshot.clone())
    }
}

#[async_trait]
impl CandidateRepository for InMemoryStore {
    async fn commit_batch(
        &self,
        pairs: &[NewCandidatePair],
        advance: Option<ProgressAdvance>,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        if std::mem::take(&mut state.fail_next_commit) {
            warn!(
                subsystem = "db",
                component = "memory",
                op = "commit_batch",
                offered = pairs.len(),
                "Injected commit failure"
            );
            return Err(Error::Internal("injected commit failure".into()));
        }
        for pair in pairs {
            if pair.claim_a >= pair.claim_b || pair.document_a == pair.document_b {
                return Err(Error::InvalidInput(format!(
                    "pair ({}, {}) violates canonical ordering or document distinctness",
                    pair.claim_a, pair.claim_b
                )));
            }
        }
        if let Some(adv) = advance {
            let run = state
                .runs
                .iter()
                .find(|r| r.id == adv.run_id)
                .ok_or(Error::RunNotFound(adv.run_id))?;
            if run.status != RunStatus::InProgress {
                return Err(Error::InvalidState(format!(
                    "run {} is {}, not in_progress",
                    run.id, run.status
                )));
            }
        }

        let now = Utc::now();
        let mut inserted = 0u64;
        for pair in pairs {
            let key = pair.key();
            if state.candidates.contains_key(&key) {
                continue;
            }
            let id = new_v7();
            state.candidate_keys.insert(id, key);
            state.candidates.insert(
                key,
                CandidatePair {
                    id,
                    claim_a: pair.claim_a,
                    claim_b: pair.claim_b,
                    similarity: pair.similarity,
                    document_a: pair.document_a,
                    document_b: pair.document_b,
                    run_id: pair.run_id,
                    status: EvaluationStatus::Pending,
                    attempts: 0,
                    score: None,
                    quality_tier: None,
                    last_error: None,
                    used: false,
                    created_at: now,
                    evaluated_at: None,
                },
            );
            inserted += 1;
        }

        if let Some(mut adv) = advance {
            adv.pairs_inserted = inserted as i64;
            apply_advance(&mut state, adv)?;
        }
        debug!(
            subsystem = "db",
            component = "memory",
            op = "commit_batch",
            offered = pairs.len(),
            pairs_inserted = inserted,
            "Candidate batch committed"
        );
        Ok(inserted)
    }

    async fn get_candidate(&self, id: Uuid) -> Result<Option<CandidatePair>> {
        let state = self.lock()?;
        Ok(state
            .candidate_keys
            .get(&id)
            .and_then(|k| state.candidates.get(k))
            .cloned())
    }

    async fn candidate_count(&self) -> Result<i64> {
        Ok(self.lock()?.candidates.len() as i64)
    }

    async fn scored_unused(&self, tier: QualityTier, limit: i64) -> Result<Vec<CandidatePair>> {
        let state = self.lock()?;
        let mut rows: Vec<CandidatePair> = state
            .candidates
            .values()
            .filter(|c| {
                !c.used && c.status == EvaluationStatus::Completed && c.quality_tier == Some(tier)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .total_cmp(&a.score.unwrap_or(0.0))
                .then(a.id.cmp(&b.id))
        });
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_used(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock()?;
        candidate_mut(&mut state, id)?.used = true;
        Ok(())
    }
}

#[async_trait]
impl EvaluationQueue for InMemoryStore {
    async fn claim_for_evaluation(&self, limit: i64) -> Result<Vec<CandidatePair>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut pending: Vec<(DateTime<Utc>, Uuid, CanonicalPair)> = state
            .candidates
            .iter()
            .filter(|(_, c)| c.status == EvaluationStatus::Pending)
            .map(|(k, c)| (c.created_at, c.id, *k))
            .collect();
        pending.sort();
        pending.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(pending.len());
        for (_, id, key) in pending {
            if let Some(pair) = state.candidates.get_mut(&key) {
                pair.status = EvaluationStatus::Processing;
                claimed.push(pair.clone());
            }
            state.claimed_at.insert(id, now);
        }
        Ok(claimed)
    }

    async fn complete_evaluation(&self, id: Uuid, score: f64) -> Result<Option<QualityTier>> {
        if !(0.0..=defaults::SCORE_MAX).contains(&score) {
            return Err(Error::InvalidInput(format!(
                "score {score} outside [0, {}]",
                defaults::SCORE_MAX
            )));
        }
        let mut state = self.lock()?;
        let pair = candidate_mut(&mut state, id)?;
        if pair.status != EvaluationStatus::Processing {
            return Err(Error::InvalidState(format!(
                "pair {id} is {}, not processing",
                pair.status
            )));
        }
        let tier = QualityTier::from_score(score);
        pair.status = EvaluationStatus::Completed;
        pair.score = Some(score);
        pair.quality_tier = tier;
        pair.evaluated_at = Some(Utc::now());
        state.claimed_at.remove(&id);
        Ok(tier)
    }

    async fn fail_evaluation(
        &self,
        id: Uuid,
        reason: &str,
        max_attempts: i32,
    ) -> Result<EvaluationStatus> {
        let mut state = self.lock()?;
        let pair = candidate_mut(&mut state, id)?;
        if pair.status != EvaluationStatus::Processing {
            return Err(Error::InvalidState(format!(
                "pair {id} is {}, not processing",
                pair.status
            )));
        }
        pair.attempts += 1;
        pair.last_error = Some(reason.to_string());
        pair.status = if pair.attempts >= max_attempts {
            EvaluationStatus::Failed
        } else {
            EvaluationStatus::Pending
        };
        let status = pair.status;
        state.claimed_at.remove(&id);
        Ok(status)
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let stale: Vec<Uuid> = state
            .claimed_at
            .iter()
            .filter(|(_, at)| **at < claimed_before)
            .map(|(id, _)| *id)
            .collect();
        let mut released = 0;
        for id in stale {
            state.claimed_at.remove(&id);
            let pair = candidate_mut(&mut state, id)?;
            if pair.status == EvaluationStatus::Processing {
                pair.status = EvaluationStatus::Pending;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn pending_evaluation_count(&self) -> Result<i64> {
        Ok(self
            .lock()?
            .candidates
            .values()
            .filter(|c| c.status == EvaluationStatus::Pending)
            .count() as i64)
    }
}

#[async_trait]
impl ProgressRepository for InMemoryStore {
    async fn start_run(
        &self,
        params: &MiningParams,
        resume_from: Option<Uuid>,
    ) -> Result<MiningProgress> {
        let mut state = self.lock()?;
        if let Some(active) = state
            .runs
            .iter()
            .find(|r| r.status == RunStatus::InProgress)
        {
            return Err(Error::ConcurrentRun(active.id));
        }

        let now = Utc::now();
        let mut run = MiningProgress {
            id: new_v7(),
            status: RunStatus::InProgress,
            last_source_id: 0,
            sources_processed: 0,
            pairs_inserted: 0,
            batches: 0,
            params: params.clone(),
            resumed_from: None,
            last_error: None,
            consecutive_failures: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
        };

        if let Some(prev_id) = resume_from {
            let prev = state
                .runs
                .iter()
                .find(|r| r.id == prev_id)
                .ok_or(Error::RunNotFound(prev_id))?;
            if !matches!(prev.status, RunStatus::Paused | RunStatus::Failed) {
                return Err(Error::InvalidState(format!(
                    "run {prev_id} is {}, only paused or failed runs can be resumed",
                    prev.status
                )));
            }
            run.last_source_id = prev.last_source_id;
            run.sources_processed = prev.sources_processed;
            run.pairs_inserted = prev.pairs_inserted;
            run.batches = prev.batches;
            run.params = prev.params.clone();
            run.resumed_from = Some(prev_id);
        }

        state.runs.push(run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<MiningProgress>> {
        Ok(self.lock()?.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn active_run(&self) -> Result<Option<MiningProgress>> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .find(|r| r.status == RunStatus::InProgress)
            .cloned())
    }

    async fn latest_run(&self) -> Result<Option<MiningProgress>> {
        Ok(self.lock()?.runs.last().cloned())
    }

    async fn advance(&self, advance: ProgressAdvance) -> Result<MiningProgress> {
        apply_advance(&mut *self.lock()?, advance)
    }

    async fn record_failure(&self, id: Uuid, reason: &str) -> Result<MiningProgress> {
        let mut state = self.lock()?;
        let run = run_mut(&mut state, id)?;
        run.consecutive_failures += 1;
        run.last_error = Some(reason.to_string());
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn pause(&self, id: Uuid) -> Result<MiningProgress> {
        transition(&mut *self.lock()?, id, RunStatus::Paused, None)
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<MiningProgress> {
        transition(&mut *self.lock()?, id, RunStatus::Failed, Some(reason))
    }

    async fn complete(&self, id: Uuid) -> Result<MiningProgress> {
        transition(&mut *self.lock()?, id, RunStatus::Completed, None)
    }
}
