//! Storage handles shared by the engines.

use std::sync::Arc;

use serendip_core::{
    CandidateRepository, ClaimCorpus, DistributionRepository, EvaluationQueue,
    ObservationRepository, ProgressRepository,
};
use serendip_db::Database;

/// Every repository the engines use, as shared trait objects.
#[derive(Clone)]
pub struct Stores {
    pub corpus: Arc<dyn ClaimCorpus>,
    pub observations: Arc<dyn ObservationRepository>,
    pub distribution: Arc<dyn DistributionRepository>,
    pub candidates: Arc<dyn CandidateRepository>,
    pub evaluation: Arc<dyn EvaluationQueue>,
    pub progress: Arc<dyn ProgressRepository>,
}

impl Stores {
    /// PostgreSQL-backed stores.
    pub fn from_database(db: &Database) -> Self {
        Self {
            corpus: Arc::new(db.corpus.clone()),
            observations: Arc::new(db.observations.clone()),
            distribution: Arc::new(db.observations.clone()),
            candidates: Arc::new(db.candidates.clone()),
            evaluation: Arc::new(db.candidates.clone()),
            progress: Arc::new(db.progress.clone()),
        }
    }

    /// Stores backed by a single value implementing every repository trait,
    /// such as the in-memory store.
    pub fn from_store<S>(store: S) -> Self
    where
        S: ClaimCorpus
            + ObservationRepository
            + DistributionRepository
            + CandidateRepository
            + EvaluationQueue
            + ProgressRepository
            + 'static,
    {
        let shared = Arc::new(store);
        Self {
            corpus: shared.clone(),
            observations: shared.clone(),
            distribution: shared.clone(),
            candidates: shared.clone(),
            evaluation: shared.clone(),
            progress: shared,
        }
    }
}
