//! Centralized default constants for serendip.
//!
//! **This module is the single source of truth** for mining policy defaults.
//! Every value here can be overridden through the parameter structs
//! (`MiningParams`, `SketchParams`, `RecommendConfig`), and a run's effective
//! values are persisted in its parameter snapshot.

// =============================================================================
// CANDIDATE MINING
// =============================================================================

/// Number of source claims processed per miner invocation.
pub const SOURCE_BATCH_SIZE: i64 = 30;

/// Number of destination claims sampled per round.
pub const DEST_SAMPLE_SIZE: i64 = 1200;

/// Maximum candidates kept per source claim.
pub const PER_SOURCE_QUOTA: i64 = 15;

/// Lower percentile of the acceptance band.
pub const BAND_LOW: f64 = 0.10;

/// Upper percentile of the acceptance band.
pub const BAND_HIGH: f64 = 0.35;

/// Default mining seed.
pub const SEED: i64 = 42;

/// Maximum sampling rounds per miner invocation.
pub const MAX_ROUNDS: i32 = 3;

/// Fraction of `SOURCE_BATCH_SIZE * PER_SOURCE_QUOTA` that ends the round loop early.
pub const EARLY_STOP_RATIO: f64 = 0.5;

/// Consecutive failed batches after which the runner fails the run.
pub const MAX_CONSECUTIVE_FAILURES: i32 = 5;

// =============================================================================
// SEED DERIVATION
// =============================================================================

/// Per-round seed increment (2^64 / golden ratio) to decorrelate successive rounds.
pub const SEED_INCREMENT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Offset between the source and destination seeds of one sketch round.
pub const DEST_SEED_OFFSET: u64 = 1_000_000_007;

// =============================================================================
// DISTRIBUTION SKETCH
// =============================================================================

/// Source claims sampled per sketch round.
pub const SKETCH_SOURCE_SAMPLE: i64 = 400;

/// Destination claims sampled per sketch round.
pub const SKETCH_DEST_SAMPLE: i64 = 400;

/// Sketch rounds per invocation.
pub const SKETCH_ROUNDS: i32 = 4;

/// Maximum observations aggregated by the estimator.
pub const ESTIMATOR_OBSERVATION_CAP: i64 = 1_000_000;

/// Days similarity observations are retained before purge.
pub const OBSERVATION_RETENTION_DAYS: i64 = 30;

/// Sampling policy label recorded with sketch observations.
pub const SAMPLING_POLICY: &str = "sample_key_range";

// =============================================================================
// TIME BUDGET
// =============================================================================

/// Hard wall-clock budget per unit of work in seconds.
pub const UNIT_OF_WORK_BUDGET_SECS: u64 = 60;

/// Fraction of the budget after which no new mining round is started.
pub const ROUND_SOFT_BUDGET_RATIO: f64 = 0.5;

// =============================================================================
// EVALUATION QUEUE
// =============================================================================

/// Evaluation attempts before a candidate pair is terminally failed.
pub const EVALUATION_MAX_ATTEMPTS: i32 = 3;

/// Default evaluation claim batch size.
pub const EVALUATION_BATCH_SIZE: i64 = 20;

/// Seconds after which a `processing` row is considered abandoned.
pub const EVALUATION_STALE_SECS: i64 = 900;

// =============================================================================
// RECOMMENDATION
// =============================================================================

/// Default number of recommended pairs.
pub const RECOMMEND_LIMIT: usize = 10;

/// Raw candidates fetched per requested result before re-ranking.
pub const RECOMMEND_OVERFETCH: usize = 2;

/// Default diversity weight in the blended score.
pub const DIVERSITY_WEIGHT: f64 = 0.3;

/// Scale applied to the diversity score so it is comparable to quality scores.
pub const DIVERSITY_SCALE: f64 = 100.0;

// =============================================================================
// QUALITY TIERS
// =============================================================================

/// Minimum evaluator score for the "excellent" tier.
pub const TIER_EXCELLENT_MIN: f64 = 85.0;

/// Minimum evaluator score for the "premium" tier.
pub const TIER_PREMIUM_MIN: f64 = 70.0;

/// Minimum evaluator score for the "standard" tier.
pub const TIER_STANDARD_MIN: f64 = 50.0;

/// Maximum evaluator score.
pub const SCORE_MAX: f64 = 100.0;

/// Environment override for a default; unset or unparseable keys yield
/// `default`.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_is_ordered() {
        assert!(BAND_LOW >= 0.0);
        assert!(BAND_LOW < BAND_HIGH);
        assert!(BAND_HIGH <= 1.0);
    }

    #[test]
    fn test_tiers_are_ordered() {
        assert!(TIER_STANDARD_MIN < TIER_PREMIUM_MIN);
        assert!(TIER_PREMIUM_MIN < TIER_EXCELLENT_MIN);
        assert!(TIER_EXCELLENT_MIN <= SCORE_MAX);
    }

    #[test]
    fn test_env_or_falls_back_on_unparseable_value() {
        std::env::set_var("SERENDIP_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("SERENDIP_TEST_ENV_OR", 7i64), 7);
        std::env::set_var("SERENDIP_TEST_ENV_OR", " 12 ");
        assert_eq!(env_or("SERENDIP_TEST_ENV_OR", 7i64), 12);
        std::env::remove_var("SERENDIP_TEST_ENV_OR");
        assert_eq!(env_or("SERENDIP_TEST_ENV_OR", 7i64), 7);
    }

    #[test]
    fn test_seed_increment_is_odd() {
        // An odd increment visits every u64 before repeating.
        assert_eq!(SEED_INCREMENT % 2, 1);
    }
}
