//! Core traits for serendip storage abstractions.
//!
//! These traits define the interfaces the mining engines depend on. The
//! PostgreSQL implementations live in `serendip-db`; the in-memory
//! implementation in [`crate::memory`] backs engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// EMBEDDING CORPUS
// =============================================================================

/// Read access to claim embeddings, plus the ingestion surface.
#[async_trait]
pub trait ClaimCorpus: Send + Sync {
    /// Store a claim with a fresh uniform `sample_key`.
    async fn insert_claim(&self, claim: NewClaim) -> Result<ClaimId>;

    /// Number of embedded claims.
    async fn claim_count(&self) -> Result<i64>;

    /// Highest claim id, if any.
    async fn max_claim_id(&self) -> Result<Option<ClaimId>>;

    /// The next `limit` claims with id greater than `after`, ordered by id.
    async fn next_sources(&self, after: ClaimId, limit: i64) -> Result<Vec<ClaimEmbedding>>;

    /// Up to `limit` claims in `sample_key` order starting at `start`,
    /// wrapping around to `0.0` when the range runs off the end.
    async fn sample_range(&self, start: f64, limit: i64) -> Result<Vec<ClaimEmbedding>>;
}

// =============================================================================
// DISTRIBUTION SKETCH
// =============================================================================

/// Storage for raw similarity observations.
#[async_trait]
pub trait ObservationRepository: Send + Sync {
    /// Insert one round's observations atomically. Returns rows written.
    async fn insert_observations(&self, observations: &[SimilarityObservation]) -> Result<u64>;

    /// Most recent sketch run, if any.
    async fn latest_observation_run(&self) -> Result<Option<Uuid>>;

    /// Up to `cap` similarity values of a run.
    async fn observation_values(&self, run_id: Uuid, cap: i64) -> Result<Vec<f64>>;

    /// Total observations stored for a run.
    async fn observation_count(&self, run_id: Uuid) -> Result<i64>;

    /// Delete every run created before `cutoff`, except `keep_run`.
    async fn purge_observations(
        &self,
        cutoff: DateTime<Utc>,
        keep_run: Option<Uuid>,
    ) -> Result<u64>;
}

/// The single cached distribution snapshot.
#[async_trait]
pub trait DistributionRepository: Send + Sync {
    /// Atomically replace the current snapshot.
    async fn upsert_snapshot(&self, snapshot: &DistributionSnapshot) -> Result<()>;

    /// The current snapshot, if one has been computed.
    async fn current_snapshot(&self) -> Result<Option<DistributionSnapshot>>;
}

// =============================================================================
// CANDIDATE PAIRS
// =============================================================================

/// Storage for mined candidate pairs.
#[async_trait]
pub trait CandidateRepository: Send + Sync {
    /// Insert pairs (ignoring ones that already exist) and apply `advance`
    /// to its run, all in one transaction. Returns pairs actually inserted.
    ///
    /// The run is credited with the inserted count; the caller's
    /// `advance.pairs_inserted` is ignored.
    async fn commit_batch(
        &self,
        pairs: &[NewCandidatePair],
        advance: Option<ProgressAdvance>,
    ) -> Result<u64>;

    /// Fetch one pair.
    async fn get_candidate(&self, id: Uuid) -> Result<Option<CandidatePair>>;

    /// Total stored pairs.
    async fn candidate_count(&self) -> Result<i64>;

    /// Unused, evaluated pairs in `tier`, best score first.
    async fn scored_unused(&self, tier: QualityTier, limit: i64) -> Result<Vec<CandidatePair>>;

    /// Flag a pair as consumed by content generation.
    async fn mark_used(&self, id: Uuid) -> Result<()>;
}

/// Queue view of pending pairs for the external evaluator.
#[async_trait]
pub trait EvaluationQueue: Send + Sync {
    /// Move up to `limit` pending pairs to `processing` and return them.
    async fn claim_for_evaluation(&self, limit: i64) -> Result<Vec<CandidatePair>>;

    /// Record a score; returns the derived tier (`None` below the standard floor).
    async fn complete_evaluation(&self, id: Uuid, score: f64) -> Result<Option<QualityTier>>;

    /// Record a failed attempt. The pair returns to `pending` until
    /// `max_attempts` is reached, then stays `failed`. Returns the new status.
    async fn fail_evaluation(
        &self,
        id: Uuid,
        reason: &str,
        max_attempts: i32,
    ) -> Result<EvaluationStatus>;

    /// Return `processing` pairs claimed before `claimed_before` to `pending`.
    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    /// Pairs awaiting evaluation.
    async fn pending_evaluation_count(&self) -> Result<i64>;
}

// =============================================================================
// MINING PROGRESS
// =============================================================================

/// Resumability records for mining runs. At most one run is `in_progress`.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Create and activate a run. Fails with `Error::ConcurrentRun` when another
    /// run is `in_progress`. With `resume_from`, the new run inherits that
    /// run's cursor, counts and parameter snapshot; `params` is ignored.
    async fn start_run(
        &self,
        params: &MiningParams,
        resume_from: Option<Uuid>,
    ) -> Result<MiningProgress>;

    /// Fetch a run.
    async fn get_run(&self, id: Uuid) -> Result<Option<MiningProgress>>;

    /// The `in_progress` run, if any.
    async fn active_run(&self) -> Result<Option<MiningProgress>>;

    /// Most recently started run.
    async fn latest_run(&self) -> Result<Option<MiningProgress>>;

    /// Move the cursor forward and add to the run's counts.
    async fn advance(&self, advance: ProgressAdvance) -> Result<MiningProgress>;

    /// Record a failed batch without moving the cursor.
    async fn record_failure(&self, id: Uuid, reason: &str) -> Result<MiningProgress>;

    /// `in_progress` → `paused`.
    async fn pause(&self, id: Uuid) -> Result<MiningProgress>;

    /// `in_progress` → `failed`.
    async fn fail(&self, id: Uuid, reason: &str) -> Result<MiningProgress>;

    /// `in_progress` → `completed`.
    async fn complete(&self, id: Uuid) -> Result<MiningProgress>;
}
