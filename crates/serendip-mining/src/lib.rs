//! # serendip-mining
//!
//! Sampling-based weak-tie discovery over a claim embedding corpus.
//!
//! This crate provides:
//! - [`DistributionSketchBuilder`]: bounded random samples of pair similarities
//! - [`DistributionEstimator`]: percentile snapshot of the sampled distribution
//! - [`CandidateMiner`]: quota-driven, percentile-banded pair mining per source batch
//! - [`MiningRunner`]: resumable run lifecycle on top of the miner
//! - [`RecommendationEngine`]: quality/diversity re-ranking of evaluated pairs
//! - [`EvaluationService`]: queue maintenance for the external scorer
//!
//! Engines are written against the repository traits in `serendip-core`, so
//! they run unchanged on PostgreSQL ([`Stores::from_database`]) or on the
//! in-memory store ([`Stores::from_store`]).

pub mod band;
pub mod config;
pub mod estimator;
pub mod evaluation;
pub mod miner;
pub mod recommend;
pub mod runner;
pub mod sketch;
pub mod stores;

pub use band::Band;
pub use config::{
    EstimatorConfig, EvaluationConfig, RecommendConfig, RunnerConfig, WorkBudget,
};
pub use estimator::DistributionEstimator;
pub use evaluation::EvaluationService;
pub use miner::{CandidateMiner, MineReport, MineRequest, MiningFailure};
pub use recommend::{Recommendation, RecommendRequest, RecommendationEngine};
pub use runner::{BatchOutcome, MiningRunner, RunSummary};
pub use sketch::{DistributionSketchBuilder, SketchFailure, SketchReport};
pub use stores::Stores;
