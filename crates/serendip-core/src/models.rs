//! Core data models for serendip.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults::{self, env_or};
use crate::error::{Error, Result};

/// Embedding vector type (re-exported from pgvector).
pub use pgvector::Vector;

/// Claim identifiers are totally ordered; keyset pagination and pair
/// canonicalization both rely on that order.
pub type ClaimId = i64;

/// Identifier of the document a claim was extracted from.
pub type DocumentId = Uuid;

// =============================================================================
// EMBEDDING CORPUS
// =============================================================================

/// A claim's embedding plus the keys the mining subsystem samples by.
#[derive(Debug, Clone)]
pub struct ClaimEmbedding {
    pub id: ClaimId,
    pub document_id: DocumentId,
    pub vector: Vector,
    /// Uniform random key in `[0, 1)`, assigned once at creation.
    pub sample_key: f64,
}

/// A claim handed over by the ingestion collaborator.
#[derive(Debug, Clone)]
pub struct NewClaim {
    pub document_id: DocumentId,
    pub text: String,
    pub vector: Vector,
}

// =============================================================================
// DISTRIBUTION SKETCH
// =============================================================================

/// One sampled pairwise similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityObservation {
    pub run_id: Uuid,
    /// Clamped to `[0, 1]`.
    pub similarity: f32,
    pub source_claim_id: Option<ClaimId>,
    pub dest_claim_id: Option<ClaimId>,
    pub seed: i64,
    pub sampling_policy: String,
}

/// Percentile points stored in a snapshot: 0, 10, ..., 100.
pub const PERCENTILE_POINTS: [f64; 11] = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

/// The single cached similarity-distribution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSnapshot {
    /// Sketch run the snapshot was computed from.
    pub run_id: Uuid,
    pub corpus_size: i64,
    pub observation_count: i64,
    /// Values at [`PERCENTILE_POINTS`], ascending.
    pub percentiles: Vec<f64>,
    pub mean: f64,
    pub stddev: f64,
    pub is_approximate: bool,
    pub compute_ms: i64,
    pub computed_at: DateTime<Utc>,
}

impl DistributionSnapshot {
    /// Similarity at percentile `p` (fraction in `[0, 1]`), linearly
    /// interpolated between the stored deciles.
    pub fn similarity_at(&self, p: f64) -> Option<f64> {
        if self.percentiles.len() != PERCENTILE_POINTS.len() {
            return None;
        }
        let p = p.clamp(0.0, 1.0);
        let pos = p * (PERCENTILE_POINTS.len() - 1) as f64;
        let lower = pos.floor() as usize;
        let upper = pos.ceil() as usize;
        let frac = pos - lower as f64;
        Some(self.percentiles[lower] + (self.percentiles[upper] - self.percentiles[lower]) * frac)
    }
}

// =============================================================================
// CANDIDATE PAIRS
// =============================================================================

/// Evaluation state of a candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Processing => "processing",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EvaluationStatus::Pending),
            "processing" => Ok(EvaluationStatus::Processing),
            "completed" => Ok(EvaluationStatus::Completed),
            "failed" => Ok(EvaluationStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown evaluation status: {other}"
            ))),
        }
    }
}

/// Named evaluator score range used to prioritize retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Premium,
    Standard,
}

impl QualityTier {
    /// All tiers, best first.
    pub const ALL: [QualityTier; 3] = [
        QualityTier::Excellent,
        QualityTier::Premium,
        QualityTier::Standard,
    ];

    /// Tier for an evaluator score, or `None` when below the standard floor.
    pub fn from_score(score: f64) -> Option<Self> {
        if score >= defaults::TIER_EXCELLENT_MIN {
            Some(QualityTier::Excellent)
        } else if score >= defaults::TIER_PREMIUM_MIN {
            Some(QualityTier::Premium)
        } else if score >= defaults::TIER_STANDARD_MIN {
            Some(QualityTier::Standard)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Premium => "premium",
            QualityTier::Standard => "standard",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "excellent" => Ok(QualityTier::Excellent),
            "premium" => Ok(QualityTier::Premium),
            "standard" => Ok(QualityTier::Standard),
            other => Err(Error::InvalidInput(format!("unknown quality tier: {other}"))),
        }
    }
}

/// An unordered claim pair stored with the smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalPair {
    pub a: ClaimId,
    pub b: ClaimId,
}

impl CanonicalPair {
    /// Canonicalize `(x, y)`; `None` for a self-pair.
    pub fn new(x: ClaimId, y: ClaimId) -> Option<Self> {
        match x.cmp(&y) {
            std::cmp::Ordering::Less => Some(Self { a: x, b: y }),
            std::cmp::Ordering::Greater => Some(Self { a: y, b: x }),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// A mined pair ready for insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCandidatePair {
    pub claim_a: ClaimId,
    pub claim_b: ClaimId,
    pub similarity: f32,
    pub document_a: DocumentId,
    pub document_b: DocumentId,
    pub run_id: Option<Uuid>,
}

impl NewCandidatePair {
    /// Build a canonical pair from two claims.
    ///
    /// Returns `None` for self-pairs and same-document pairs.
    pub fn from_claims(
        x: &ClaimEmbedding,
        y: &ClaimEmbedding,
        similarity: f32,
        run_id: Option<Uuid>,
    ) -> Option<Self> {
        if x.document_id == y.document_id {
            return None;
        }
        let pair = CanonicalPair::new(x.id, y.id)?;
        let (document_a, document_b) = if pair.a == x.id {
            (x.document_id, y.document_id)
        } else {
            (y.document_id, x.document_id)
        };
        Some(Self {
            claim_a: pair.a,
            claim_b: pair.b,
            similarity,
            document_a,
            document_b,
            run_id,
        })
    }

    pub fn key(&self) -> CanonicalPair {
        CanonicalPair {
            a: self.claim_a,
            b: self.claim_b,
        }
    }
}

/// A persisted candidate pair with its evaluation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub id: Uuid,
    pub claim_a: ClaimId,
    pub claim_b: ClaimId,
    pub similarity: f32,
    pub document_a: DocumentId,
    pub document_b: DocumentId,
    pub run_id: Option<Uuid>,
    pub status: EvaluationStatus,
    pub attempts: i32,
    pub score: Option<f64>,
    pub quality_tier: Option<QualityTier>,
    pub last_error: Option<String>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

// =============================================================================
// MINING RUNS
// =============================================================================

/// Lifecycle of a mining run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Paused,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
        }
    }

    /// Completed, paused and failed runs never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Paused | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "paused" => Ok(RunStatus::Paused),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown run status: {other}"))),
        }
    }
}

/// Where the miner takes its acceptance band from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandSource {
    /// Percentiles of each round's own similarities.
    #[default]
    Local,
    /// Percentiles of the cached distribution snapshot.
    Global,
}

impl FromStr for BandSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BandSource::Local),
            "global" => Ok(BandSource::Global),
            other => Err(Error::InvalidInput(format!("unknown band source: {other}"))),
        }
    }
}

/// Parameters of a mining run, persisted as the run's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningParams {
    pub source_batch_size: i64,
    pub dest_sample_size: i64,
    pub per_source_quota: i64,
    pub band_low: f64,
    pub band_high: f64,
    pub seed: i64,
    pub max_rounds: i32,
    #[serde(default = "default_early_stop_ratio")]
    pub early_stop_ratio: f64,
    #[serde(default)]
    pub band_source: BandSource,
}

fn default_early_stop_ratio() -> f64 {
    defaults::EARLY_STOP_RATIO
}

impl Default for MiningParams {
    fn default() -> Self {
        Self {
            source_batch_size: defaults::SOURCE_BATCH_SIZE,
            dest_sample_size: defaults::DEST_SAMPLE_SIZE,
            per_source_quota: defaults::PER_SOURCE_QUOTA,
            band_low: defaults::BAND_LOW,
            band_high: defaults::BAND_HIGH,
            seed: defaults::SEED,
            max_rounds: defaults::MAX_ROUNDS,
            early_stop_ratio: defaults::EARLY_STOP_RATIO,
            band_source: BandSource::Local,
        }
    }
}

impl MiningParams {
    /// Create params from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SERENDIP_SOURCE_BATCH` | `30` |
    /// | `SERENDIP_DEST_SAMPLE` | `1200` |
    /// | `SERENDIP_PER_SOURCE_K` | `15` |
    /// | `SERENDIP_BAND_LOW` | `0.10` |
    /// | `SERENDIP_BAND_HIGH` | `0.35` |
    /// | `SERENDIP_SEED` | `42` |
    /// | `SERENDIP_MAX_ROUNDS` | `3` |
    /// | `SERENDIP_EARLY_STOP_RATIO` | `0.5` |
    /// | `SERENDIP_BAND_SOURCE` | `local` |
    pub fn from_env() -> Self {
        Self {
            source_batch_size: env_or("SERENDIP_SOURCE_BATCH", defaults::SOURCE_BATCH_SIZE),
            dest_sample_size: env_or("SERENDIP_DEST_SAMPLE", defaults::DEST_SAMPLE_SIZE),
            per_source_quota: env_or("SERENDIP_PER_SOURCE_K", defaults::PER_SOURCE_QUOTA),
            band_low: env_or("SERENDIP_BAND_LOW", defaults::BAND_LOW),
            band_high: env_or("SERENDIP_BAND_HIGH", defaults::BAND_HIGH),
            seed: env_or("SERENDIP_SEED", defaults::SEED),
            max_rounds: env_or("SERENDIP_MAX_ROUNDS", defaults::MAX_ROUNDS),
            early_stop_ratio: env_or("SERENDIP_EARLY_STOP_RATIO", defaults::EARLY_STOP_RATIO),
            band_source: env_or("SERENDIP_BAND_SOURCE", BandSource::Local),
        }
    }

    /// Reject parameter sets the miner cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.source_batch_size <= 0 || self.dest_sample_size <= 0 {
            return Err(Error::InvalidInput(
                "batch and sample sizes must be positive".into(),
            ));
        }
        if self.per_source_quota <= 0 {
            return Err(Error::InvalidInput("per-source quota must be positive".into()));
        }
        if self.max_rounds <= 0 {
            return Err(Error::InvalidInput("max rounds must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.band_low)
            || !(0.0..=1.0).contains(&self.band_high)
            || self.band_low >= self.band_high
        {
            return Err(Error::InvalidInput(format!(
                "band [{}, {}] must satisfy 0 <= low < high <= 1",
                self.band_low, self.band_high
            )));
        }
        if !(0.0..=1.0).contains(&self.early_stop_ratio) {
            return Err(Error::InvalidInput(
                "early stop ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Theoretical maximum number of pairs one invocation may insert.
    pub fn max_pairs_per_batch(&self) -> i64 {
        self.source_batch_size * self.per_source_quota
    }
}

/// Parameters of one distribution sketch invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchParams {
    pub seed: i64,
    pub source_sample: i64,
    pub dest_sample: i64,
    pub rounds: i32,
    pub exclude_same_document: bool,
}

impl Default for SketchParams {
    fn default() -> Self {
        Self {
            seed: defaults::SEED,
            source_sample: defaults::SKETCH_SOURCE_SAMPLE,
            dest_sample: defaults::SKETCH_DEST_SAMPLE,
            rounds: defaults::SKETCH_ROUNDS,
            exclude_same_document: true,
        }
    }
}

impl SketchParams {
    /// Create params from `SERENDIP_SKETCH_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            seed: env_or("SERENDIP_SEED", defaults::SEED),
            source_sample: env_or("SERENDIP_SKETCH_SOURCE", defaults::SKETCH_SOURCE_SAMPLE),
            dest_sample: env_or("SERENDIP_SKETCH_DEST", defaults::SKETCH_DEST_SAMPLE),
            rounds: env_or("SERENDIP_SKETCH_ROUNDS", defaults::SKETCH_ROUNDS),
            exclude_same_document: env_or("SERENDIP_SKETCH_EXCLUDE_SAME_DOC", true),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_sample <= 0 || self.dest_sample <= 0 || self.rounds <= 0 {
            return Err(Error::InvalidInput(
                "sketch sample sizes and rounds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A mining run's resumability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningProgress {
    pub id: Uuid,
    pub status: RunStatus,
    /// Highest source claim id whose batch has been committed (0 before the first).
    pub last_source_id: ClaimId,
    pub sources_processed: i64,
    pub pairs_inserted: i64,
    pub batches: i64,
    pub params: MiningParams,
    pub resumed_from: Option<Uuid>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Cursor advance applied together with a batch's pair inserts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressAdvance {
    pub run_id: Uuid,
    pub cursor: ClaimId,
    pub sources_processed: i64,
    /// Overwritten by `CandidateRepository::commit_batch` with the number of
    /// rows it actually inserted.
    pub pairs_inserted: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(id: ClaimId, document_id: DocumentId) -> ClaimEmbedding {
        ClaimEmbedding {
            id,
            document_id,
            vector: Vector::from(vec![1.0, 0.0]),
            sample_key: 0.5,
        }
    }

    #[test]
    fn test_canonical_pair_orders_ids() {
        let p = CanonicalPair::new(9, 3).unwrap();
        assert_eq!((p.a, p.b), (3, 9));
        assert_eq!(CanonicalPair::new(3, 9), CanonicalPair::new(9, 3));
    }

    #[test]
    fn test_canonical_pair_rejects_self_pair() {
        assert!(CanonicalPair::new(7, 7).is_none());
    }

    #[test]
    fn test_new_pair_keeps_documents_aligned_with_claims() {
        let doc_x = Uuid::new_v4();
        let doc_y = Uuid::new_v4();
        let pair = NewCandidatePair::from_claims(&claim(10, doc_x), &claim(4, doc_y), 0.2, None)
            .unwrap();
        assert_eq!(pair.claim_a, 4);
        assert_eq!(pair.document_a, doc_y);
        assert_eq!(pair.claim_b, 10);
        assert_eq!(pair.document_b, doc_x);
    }

    #[test]
    fn test_new_pair_rejects_same_document() {
        let doc = Uuid::new_v4();
        assert!(NewCandidatePair::from_claims(&claim(1, doc), &claim(2, doc), 0.2, None).is_none());
    }

    #[test]
    fn test_quality_tier_from_score() {
        assert_eq!(QualityTier::from_score(92.0), Some(QualityTier::Excellent));
        assert_eq!(QualityTier::from_score(85.0), Some(QualityTier::Excellent));
        assert_eq!(QualityTier::from_score(84.9), Some(QualityTier::Premium));
        assert_eq!(QualityTier::from_score(50.0), Some(QualityTier::Standard));
        assert_eq!(QualityTier::from_score(49.9), None);
    }

    #[test]
    fn test_quality_tier_parse_roundtrip() {
        for tier in QualityTier::ALL {
            assert_eq!(tier.as_str().parse::<QualityTier>().unwrap(), tier);
        }
        assert!("legendary".parse::<QualityTier>().is_err());
    }

    #[test]
    fn test_run_status_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Paused.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert_eq!("in_progress".parse::<RunStatus>().unwrap(), RunStatus::InProgress);
    }

    #[test]
    fn test_mining_params_default_is_valid() {
        let params = MiningParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.max_pairs_per_batch(), 30 * 15);
    }

    #[test]
    fn test_mining_params_rejects_inverted_band() {
        let params = MiningParams {
            band_low: 0.5,
            band_high: 0.4,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_mining_params_snapshot_tolerates_missing_optional_fields() {
        let json = serde_json::json!({
            "source_batch_size": 30,
            "dest_sample_size": 1200,
            "per_source_quota": 15,
            "band_low": 0.1,
            "band_high": 0.35,
            "seed": 42,
            "max_rounds": 3
        });
        let params: MiningParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.early_stop_ratio, defaults::EARLY_STOP_RATIO);
        assert_eq!(params.band_source, BandSource::Local);
    }

    #[test]
    fn test_snapshot_similarity_at_interpolates() {
        let snapshot = DistributionSnapshot {
            run_id: Uuid::nil(),
            corpus_size: 10,
            observation_count: 100,
            percentiles: (0..=10).map(|i| i as f64 / 10.0).collect(),
            mean: 0.5,
            stddev: 0.1,
            is_approximate: true,
            compute_ms: 1,
            computed_at: Utc::now(),
        };
        assert!((snapshot.similarity_at(0.35).unwrap() - 0.35).abs() < 1e-9);
        assert!((snapshot.similarity_at(1.0).unwrap() - 1.0).abs() < 1e-9);
        assert!((snapshot.similarity_at(0.0).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_similarity_at_requires_all_deciles() {
        let snapshot = DistributionSnapshot {
            run_id: Uuid::nil(),
            corpus_size: 0,
            observation_count: 0,
            percentiles: vec![0.1, 0.2],
            mean: 0.0,
            stddev: 0.0,
            is_approximate: true,
            compute_ms: 0,
            computed_at: Utc::now(),
        };
        assert!(snapshot.similarity_at(0.5).is_none());
    }
}
