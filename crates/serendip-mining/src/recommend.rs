//! Recommendation engine.
//!
//! Re-ranks evaluated, unused candidate pairs by blending the evaluator's
//! quality score with a diversity signal that favours pairs whose documents
//! are rare in the retrieved set:
//!
//! ```text
//! diversity = 1 / (count(document_a) + count(document_b))
//! final     = quality × (1 - w) + diversity × 100 × w
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use serendip_core::defaults::DIVERSITY_SCALE;
use serendip_core::{CandidatePair, CandidateRepository, DocumentId, Error, QualityTier, Result};

use crate::config::RecommendConfig;
use crate::stores::Stores;

/// A ranked pair.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub pair: CandidatePair,
    pub quality_score: f64,
    pub diversity_score: f64,
    pub final_score: f64,
}

/// Per-call overrides of the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct RecommendRequest {
    pub limit: Option<usize>,
    pub tiers: Option<Vec<QualityTier>>,
    pub diversity_weight: Option<f64>,
}

/// `1 / (count_a + count_b)`, or 0 when neither document was counted.
pub fn diversity_score(count_a: usize, count_b: usize) -> f64 {
    let total = count_a + count_b;
    if total == 0 {
        0.0
    } else {
        1.0 / total as f64
    }
}

/// Blend quality and diversity with weight `w` on diversity.
pub fn blend(quality: f64, diversity: f64, w: f64) -> f64 {
    quality * (1.0 - w) + diversity * DIVERSITY_SCALE * w
}

/// Occurrences of each document across both sides of `pairs`.
pub fn document_counts(pairs: &[CandidatePair]) -> HashMap<DocumentId, usize> {
    let mut counts = HashMap::new();
    for pair in pairs {
        *counts.entry(pair.document_a).or_insert(0) += 1;
        *counts.entry(pair.document_b).or_insert(0) += 1;
    }
    counts
}

/// Score `pairs` and return the best `limit` of them.
///
/// Ties on final score fall back to quality, then pair id, so the order is
/// stable across calls.
pub fn rank(pairs: Vec<CandidatePair>, w: f64, limit: usize) -> Vec<Recommendation> {
    let counts = document_counts(&pairs);
    let mut ranked: Vec<Recommendation> = pairs
        .into_iter()
        .map(|pair| {
            let count = |d: &DocumentId| counts.get(d).copied().unwrap_or(0);
            let quality_score = pair.score.unwrap_or(0.0);
            let diversity_score = diversity_score(count(&pair.document_a), count(&pair.document_b));
            Recommendation {
                final_score: blend(quality_score, diversity_score, w),
                quality_score,
                diversity_score,
                pair,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.quality_score
                    .partial_cmp(&a.quality_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.pair.id.cmp(&b.pair.id))
    });
    ranked.truncate(limit);
    ranked
}

/// Ranked read API over evaluated candidates.
pub struct RecommendationEngine {
    candidates: Arc<dyn CandidateRepository>,
    config: RecommendConfig,
}

impl RecommendationEngine {
    pub fn new(stores: &Stores, config: RecommendConfig) -> Self {
        Self {
            candidates: stores.candidates.clone(),
            config,
        }
    }

    /// Up to `limit` unused, evaluated pairs, best first. An empty candidate
    /// set yields an empty list.
    pub async fn recommend(&self, request: &RecommendRequest) -> Result<Vec<Recommendation>> {
        let limit = request.limit.unwrap_or(self.config.limit);
        let tiers = request.tiers.as_deref().unwrap_or(&self.config.tiers);
        let w = request
            .diversity_weight
            .unwrap_or(self.config.diversity_weight);
        if !(0.0..=1.0).contains(&w) {
            return Err(Error::InvalidInput(format!(
                "diversity weight {w} must be within [0, 1]"
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let wanted = limit.saturating_mul(self.config.overfetch.max(1));
        let mut pool: Vec<CandidatePair> = Vec::with_capacity(wanted);
        for tier in tiers {
            if pool.len() >= wanted {
                break;
            }
            let fetched = self
                .candidates
                .scored_unused(*tier, (wanted - pool.len()) as i64)
                .await?;
            debug!(
                subsystem = "mining",
                component = "recommend",
                tier = %tier,
                fetched = fetched.len(),
                "Tier fetched"
            );
            pool.extend(fetched);
        }

        let candidate_count = pool.len();
        let ranked = rank(pool, w, limit);
        info!(
            subsystem = "mining",
            component = "recommend",
            op = "recommend",
            candidate_count,
            result_count = ranked.len(),
            diversity_weight = w,
            "Recommendations ranked"
        );
        Ok(ranked)
    }

    /// Flag a recommended pair as consumed.
    pub async fn mark_used(&self, id: Uuid) -> Result<()> {
        self.candidates.mark_used(id).await
    }
}
