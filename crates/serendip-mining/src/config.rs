//! Engine configuration.
//!
//! Mining and sketch parameters live on the core models because they are
//! persisted with a run. Everything here is process-level policy read from
//! `SERENDIP_*` environment variables.

use std::time::{Duration, Instant};

use serendip_core::defaults::{self, env_or};
use serendip_core::QualityTier;

/// Wall-clock budget of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkBudget {
    /// Hard deadline; work still running when it passes is abandoned.
    pub limit: Duration,
    /// Fraction of `limit` after which no new mining round is started.
    pub soft_ratio: f64,
}

impl Default for WorkBudget {
    fn default() -> Self {
        Self {
            limit: Duration::from_secs(defaults::UNIT_OF_WORK_BUDGET_SECS),
            soft_ratio: defaults::ROUND_SOFT_BUDGET_RATIO,
        }
    }
}

impl WorkBudget {
    /// Create a budget from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SERENDIP_BUDGET_SECS` | `60` |
    /// | `SERENDIP_ROUND_SOFT_RATIO` | `0.5` |
    pub fn from_env() -> Self {
        Self {
            limit: Duration::from_secs(
                env_or("SERENDIP_BUDGET_SECS", defaults::UNIT_OF_WORK_BUDGET_SECS).max(1),
            ),
            soft_ratio: env_or("SERENDIP_ROUND_SOFT_RATIO", defaults::ROUND_SOFT_BUDGET_RATIO)
                .clamp(0.0, 1.0),
        }
    }

    pub fn with_limit(mut self, limit: Duration) -> Self {
        self.limit = limit;
        self
    }

    /// Time left before the hard deadline.
    pub fn remaining(&self, started: Instant) -> Duration {
        self.limit.saturating_sub(started.elapsed())
    }

    /// Whether the soft deadline has passed.
    pub fn soft_exceeded(&self, started: Instant) -> bool {
        started.elapsed() >= self.limit.mul_f64(self.soft_ratio)
    }
}

/// Mining runner policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Failed batches in a row after which the run is marked failed.
    pub max_consecutive_failures: i32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: defaults::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl RunnerConfig {
    /// Reads `SERENDIP_MAX_CONSECUTIVE_FAILURES` (default `5`).
    pub fn from_env() -> Self {
        Self {
            max_consecutive_failures: env_or(
                "SERENDIP_MAX_CONSECUTIVE_FAILURES",
                defaults::MAX_CONSECUTIVE_FAILURES,
            )
            .max(1),
        }
    }
}

/// Distribution estimator policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Maximum observations aggregated per estimate.
    pub observation_cap: i64,
    /// Observation runs older than this are purged.
    pub retention_days: i64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            observation_cap: defaults::ESTIMATOR_OBSERVATION_CAP,
            retention_days: defaults::OBSERVATION_RETENTION_DAYS,
        }
    }
}

impl EstimatorConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SERENDIP_ESTIMATOR_CAP` | `1000000` |
    /// | `SERENDIP_OBSERVATION_RETENTION_DAYS` | `30` |
    pub fn from_env() -> Self {
        Self {
            observation_cap: env_or("SERENDIP_ESTIMATOR_CAP", defaults::ESTIMATOR_OBSERVATION_CAP)
                .max(1),
            retention_days: env_or(
                "SERENDIP_OBSERVATION_RETENTION_DAYS",
                defaults::OBSERVATION_RETENTION_DAYS,
            )
            .max(0),
        }
    }
}

/// Evaluation queue policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationConfig {
    /// Failed attempts after which a pair stays `failed`.
    pub max_attempts: i32,
    /// Pairs handed out per claim.
    pub batch_size: i64,
    /// Claims older than this are returned to the queue.
    pub stale_after: Duration,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::EVALUATION_MAX_ATTEMPTS,
            batch_size: defaults::EVALUATION_BATCH_SIZE,
            stale_after: Duration::from_secs(defaults::EVALUATION_STALE_SECS as u64),
        }
    }
}

impl EvaluationConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SERENDIP_EVAL_MAX_ATTEMPTS` | `3` |
    /// | `SERENDIP_EVAL_BATCH` | `20` |
    /// | `SERENDIP_EVAL_STALE_SECS` | `900` |
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("SERENDIP_EVAL_MAX_ATTEMPTS", defaults::EVALUATION_MAX_ATTEMPTS)
                .max(1),
            batch_size: env_or("SERENDIP_EVAL_BATCH", defaults::EVALUATION_BATCH_SIZE).max(1),
            stale_after: Duration::from_secs(
                env_or("SERENDIP_EVAL_STALE_SECS", defaults::EVALUATION_STALE_SECS).max(0) as u64,
            ),
        }
    }
}

/// Recommendation defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendConfig {
    pub limit: usize,
    /// Acceptable tiers, highest priority first.
    pub tiers: Vec<QualityTier>,
    /// Weight of the diversity signal in `[0, 1]`.
    pub diversity_weight: f64,
    /// Raw candidates fetched per requested result.
    pub overfetch: usize,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            limit: defaults::RECOMMEND_LIMIT,
            tiers: QualityTier::ALL.to_vec(),
            diversity_weight: defaults::DIVERSITY_WEIGHT,
            overfetch: defaults::RECOMMEND_OVERFETCH,
        }
    }
}

impl RecommendConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SERENDIP_RECOMMEND_LIMIT` | `10` |
    /// | `SERENDIP_RECOMMEND_TIERS` | `excellent,premium,standard` |
    /// | `SERENDIP_DIVERSITY_WEIGHT` | `0.3` |
    /// | `SERENDIP_RECOMMEND_OVERFETCH` | `2` |
    pub fn from_env() -> Self {
        let tiers = std::env::var("SERENDIP_RECOMMEND_TIERS")
            .ok()
            .and_then(|v| parse_tiers(&v).ok())
            .unwrap_or_else(|| QualityTier::ALL.to_vec());

        Self {
            limit: env_or("SERENDIP_RECOMMEND_LIMIT", defaults::RECOMMEND_LIMIT),
            tiers,
            diversity_weight: env_or("SERENDIP_DIVERSITY_WEIGHT", defaults::DIVERSITY_WEIGHT)
                .clamp(0.0, 1.0),
            overfetch: env_or("SERENDIP_RECOMMEND_OVERFETCH", defaults::RECOMMEND_OVERFETCH).max(1),
        }
    }
}

/// Parse a comma-separated tier list, keeping the given order.
pub fn parse_tiers(list: &str) -> serendip_core::Result<Vec<QualityTier>> {
    let mut tiers = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let tier: QualityTier = part.parse()?;
        if !tiers.contains(&tier) {
            tiers.push(tier);
        }
    }
    if tiers.is_empty() {
        return Err(serendip_core::Error::InvalidInput(
            "at least one quality tier is required".into(),
        ));
    }
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tiers_keeps_order_and_dedups() {
        let tiers = parse_tiers("premium, excellent,premium").unwrap();
        assert_eq!(tiers, vec![QualityTier::Premium, QualityTier::Excellent]);
    }

    #[test]
    fn test_parse_tiers_rejects_empty_and_unknown() {
        assert!(parse_tiers(" , ").is_err());
        assert!(parse_tiers("excellent,gold").is_err());
    }

    #[test]
    fn test_budget_soft_deadline() {
        let budget = WorkBudget {
            limit: Duration::from_secs(60),
            soft_ratio: 0.0,
        };
        assert!(budget.soft_exceeded(Instant::now()));

        let budget = WorkBudget::default();
        assert!(!budget.soft_exceeded(Instant::now()));
        assert!(budget.remaining(Instant::now()) <= budget.limit);
    }

    #[test]
    fn test_defaults_match_core_constants() {
        let config = RecommendConfig::default();
        assert_eq!(config.tiers.len(), 3);
        assert_eq!(config.overfetch, 2);
        assert_eq!(EvaluationConfig::default().max_attempts, 3);
        assert_eq!(RunnerConfig::default().max_consecutive_failures, 5);
    }
}
