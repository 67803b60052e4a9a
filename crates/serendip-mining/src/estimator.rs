//! Distribution estimator.
//!
//! Summarises one sketch run into the single cached distribution snapshot,
//! and purges observation runs past the retention window. An estimate is one
//! unit of work and runs under the hard deadline of its `WorkBudget`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use serendip_core::similarity::{mean, percentile_cont, sorted_values, stddev};
use serendip_core::{
    ClaimCorpus, DistributionRepository, DistributionSnapshot, Error, ObservationRepository,
    Result, PERCENTILE_POINTS,
};

use crate::config::{EstimatorConfig, WorkBudget};
use crate::stores::Stores;

/// Computes and publishes the distribution snapshot.
pub struct DistributionEstimator {
    corpus: Arc<dyn ClaimCorpus>,
    observations: Arc<dyn ObservationRepository>,
    distribution: Arc<dyn DistributionRepository>,
    budget: WorkBudget,
    config: EstimatorConfig,
}

impl DistributionEstimator {
    pub fn new(stores: &Stores, budget: WorkBudget, config: EstimatorConfig) -> Self {
        Self {
            corpus: stores.corpus.clone(),
            observations: stores.observations.clone(),
            distribution: stores.distribution.clone(),
            budget,
            config,
        }
    }

    /// Summarise `run_id` (default: the most recent sketch run) and replace
    /// the current snapshot.
    ///
    /// With no observations the existing snapshot is left untouched and
    /// `Error::InsufficientData` is returned. Past the budget's hard limit the
    /// work is abandoned with `Error::Timeout`, also without touching the
    /// snapshot.
    pub async fn estimate(&self, run_id: Option<Uuid>) -> Result<DistributionSnapshot> {
        let limit = self.budget.limit;
        match tokio::time::timeout(limit, self.compute(run_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    subsystem = "mining",
                    component = "estimator",
                    op = "estimate",
                    limit_ms = limit.as_millis() as u64,
                    "Estimate abandoned at the hard deadline"
                );
                Err(Error::Timeout(limit.as_millis() as u64))
            }
        }
    }

    async fn compute(&self, run_id: Option<Uuid>) -> Result<DistributionSnapshot> {
        let started = Instant::now();

        let run_id = match run_id {
            Some(id) => id,
            None => self
                .observations
                .latest_observation_run()
                .await?
                .ok_or_else(|| Error::InsufficientData("no sketch run has been recorded".into()))?,
        };

        let values = self
            .observations
            .observation_values(run_id, self.config.observation_cap)
            .await?;
        if values.is_empty() {
            return Err(Error::InsufficientData(format!(
                "sketch run {run_id} has no observations"
            )));
        }
        let total = self.observations.observation_count(run_id).await?;
        let corpus_size = self.corpus.claim_count().await?;

        let sorted = sorted_values(values);
        let percentiles = PERCENTILE_POINTS
            .iter()
            .map(|p| percentile_cont(&sorted, *p))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| Error::Internal("percentile over empty sample".into()))?;

        let all_pairs = corpus_size.saturating_mul(corpus_size.saturating_sub(1)) / 2;
        let snapshot = DistributionSnapshot {
            run_id,
            corpus_size,
            observation_count: sorted.len() as i64,
            mean: mean(&sorted).unwrap_or(0.0),
            stddev: stddev(&sorted).unwrap_or(0.0),
            percentiles,
            is_approximate: (sorted.len() as i64) < total || (sorted.len() as i64) < all_pairs,
            compute_ms: started.elapsed().as_millis() as i64,
            computed_at: Utc::now(),
        };

        self.distribution.upsert_snapshot(&snapshot).await?;

        if (sorted.len() as i64) < total {
            warn!(
                subsystem = "mining",
                component = "estimator",
                run_id = %run_id,
                observation_count = total,
                cap = self.config.observation_cap,
                "Observation cap reached, estimate uses a prefix of the run"
            );
        }
        info!(
            subsystem = "mining",
            component = "estimator",
            op = "estimate",
            run_id = %run_id,
            observation_count = snapshot.observation_count,
            mean = snapshot.mean,
            stddev = snapshot.stddev,
            duration_ms = snapshot.compute_ms,
            "Distribution snapshot published"
        );
        Ok(snapshot)
    }

    /// The current snapshot, if any.
    pub async fn current(&self) -> Result<Option<DistributionSnapshot>> {
        self.distribution.current_snapshot().await
    }

    /// Delete observation runs older than the retention window. The run behind
    /// the current snapshot is always kept.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let keep = self
            .distribution
            .current_snapshot()
            .await?
            .map(|s| s.run_id);
        let purged = self.observations.purge_observations(cutoff, keep).await?;
        info!(
            subsystem = "mining",
            component = "estimator",
            op = "purge",
            purged,
            retention_days = self.config.retention_days,
            "Expired observations purged"
        );
        Ok(purged)
    }
}
