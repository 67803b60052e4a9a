//! Evaluation queue maintenance for the external scorer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use serendip_core::{CandidatePair, Error, EvaluationQueue, EvaluationStatus, QualityTier, Result};

use crate::config::EvaluationConfig;
use crate::stores::Stores;

/// Hands pending pairs to the scorer and records its verdicts.
pub struct EvaluationService {
    queue: Arc<dyn EvaluationQueue>,
    config: EvaluationConfig,
}

impl EvaluationService {
    pub fn new(stores: &Stores, config: EvaluationConfig) -> Self {
        Self {
            queue: stores.evaluation.clone(),
            config,
        }
    }

    /// Claim up to `limit` (default: the configured batch size) pending pairs.
    pub async fn claim(&self, limit: Option<i64>) -> Result<Vec<CandidatePair>> {
        let claimed = self
            .queue
            .claim_for_evaluation(limit.unwrap_or(self.config.batch_size))
            .await?;
        info!(
            subsystem = "mining",
            component = "evaluation",
            op = "claim",
            claimed = claimed.len(),
            "Pairs claimed for evaluation"
        );
        Ok(claimed)
    }

    pub async fn complete(&self, id: Uuid, score: f64) -> Result<Option<QualityTier>> {
        let tier = self.queue.complete_evaluation(id, score).await?;
        info!(
            subsystem = "mining",
            component = "evaluation",
            op = "complete",
            pair_id = %id,
            score,
            tier = tier.map(|t| t.as_str()),
            "Evaluation recorded"
        );
        Ok(tier)
    }

    /// Record a failed attempt; the pair is retried until the attempt cap.
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<EvaluationStatus> {
        self.queue
            .fail_evaluation(id, reason, self.config.max_attempts)
            .await
    }

    /// Return pairs stuck in `processing` past the stale timeout to the queue.
    pub async fn release_stale(&self) -> Result<u64> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| Error::Config(format!("stale timeout out of range: {e}")))?;
        let released = self.queue.release_stale(Utc::now() - stale_after).await?;
        if released > 0 {
            warn!(
                subsystem = "mining",
                component = "evaluation",
                op = "release_stale",
                released,
                "Abandoned evaluations returned to the queue"
            );
        }
        Ok(released)
    }

    pub async fn pending(&self) -> Result<i64> {
        self.queue.pending_evaluation_count().await
    }
}
