//! Distribution sketch builder.
//!
//! Draws bounded random samples of claim pairs with `sample_key` ranges and
//! stores their similarities as observations of one sketch run. Each round
//! touches at most `source_sample + dest_sample` embeddings and writes its
//! observations as one atomic insert.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use serendip_core::defaults::SAMPLING_POLICY;
use serendip_core::sampling::{dest_seed, next_round_seed, range_start};
use serendip_core::similarity::{clamp_unit, cosine_with_norms, norm};
use serendip_core::{
    new_v7, ClaimCorpus, ClaimEmbedding, Error, ObservationRepository, Result,
    SimilarityObservation, SketchParams,
};

use crate::config::WorkBudget;
use crate::stores::Stores;

/// Outcome of a completed sketch run.
#[derive(Debug, Clone, Serialize)]
pub struct SketchReport {
    pub run_id: Uuid,
    pub rounds: i32,
    pub observation_count: u64,
    pub corpus_size: i64,
    /// Sampled pairs over `N²`. A transparency signal, not a guarantee.
    pub coverage: f64,
    pub elapsed_ms: u64,
}

/// A sketch run that stopped before finishing its rounds.
///
/// Rounds that completed stay persisted; the failed round wrote nothing.
#[derive(Debug, thiserror::Error)]
#[error(
    "sketch run {run_id} failed after {rounds_completed} rounds \
     ({observations_persisted} observations kept): {source}"
)]
pub struct SketchFailure {
    pub run_id: Uuid,
    pub rounds_completed: i32,
    pub observations_persisted: u64,
    #[source]
    pub source: Error,
}

/// Builds similarity sketches from the corpus.
pub struct DistributionSketchBuilder {
    corpus: Arc<dyn ClaimCorpus>,
    observations: Arc<dyn ObservationRepository>,
    budget: WorkBudget,
}

impl DistributionSketchBuilder {
    pub fn new(stores: &Stores, budget: WorkBudget) -> Self {
        Self {
            corpus: stores.corpus.clone(),
            observations: stores.observations.clone(),
            budget,
        }
    }

    /// Run `params.rounds` sampling rounds under one new run id.
    pub async fn build(
        &self,
        params: &SketchParams,
    ) -> std::result::Result<SketchReport, SketchFailure> {
        let started = Instant::now();
        let run_id = new_v7();
        let mut rounds_completed = 0;
        let mut persisted = 0u64;

        let failure = |source: Error, rounds_completed: i32, persisted: u64| {
            error!(
                subsystem = "mining",
                component = "sketch",
                op = "build",
                run_id = %run_id,
                round = rounds_completed + 1,
                observation_count = persisted,
                error = %source,
                "Sketch run failed"
            );
            SketchFailure {
                run_id,
                rounds_completed,
                observations_persisted: persisted,
                source,
            }
        };

        if let Err(e) = params.validate() {
            return Err(failure(e, 0, 0));
        }
        let corpus_size = match self.corpus.claim_count().await {
            Ok(n) => n,
            Err(e) => return Err(failure(e, 0, 0)),
        };
        if corpus_size < 2 {
            return Err(failure(
                Error::InsufficientData(format!(
                    "corpus has {corpus_size} embedded claims, at least 2 are required"
                )),
                0,
                0,
            ));
        }

        let mut seed = params.seed;
        for round in 1..=params.rounds {
            let round_started = Instant::now();
            let outcome = tokio::time::timeout(
                self.budget.remaining(started),
                self.sketch_round(run_id, seed, params),
            )
            .await;
            let written = match outcome {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(failure(e, rounds_completed, persisted)),
                Err(_) => {
                    let limit = self.budget.limit.as_millis() as u64;
                    return Err(failure(Error::Timeout(limit), rounds_completed, persisted));
                }
            };
            persisted += written;
            rounds_completed = round;
            debug!(
                subsystem = "mining",
                component = "sketch",
                op = "round",
                run_id = %run_id,
                round,
                observation_count = written,
                duration_ms = round_started.elapsed().as_millis() as u64,
                "Sketch round persisted"
            );
            seed = next_round_seed(seed);
        }

        let report = SketchReport {
            run_id,
            rounds: rounds_completed,
            observation_count: persisted,
            corpus_size,
            coverage: coverage(
                params.source_sample.min(corpus_size),
                params.dest_sample.min(corpus_size),
                rounds_completed,
                corpus_size,
            ),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            subsystem = "mining",
            component = "sketch",
            op = "build",
            run_id = %run_id,
            rounds = report.rounds,
            observation_count = report.observation_count,
            coverage = report.coverage,
            duration_ms = report.elapsed_ms,
            "Sketch run complete"
        );
        Ok(report)
    }

    async fn sketch_round(&self, run_id: Uuid, seed: i64, params: &SketchParams) -> Result<u64> {
        let sources = self
            .corpus
            .sample_range(range_start(seed), params.source_sample)
            .await?;
        let dests = self
            .corpus
            .sample_range(range_start(dest_seed(seed)), params.dest_sample)
            .await?;
        let observations = observe(
            run_id,
            seed,
            &sources,
            &dests,
            params.exclude_same_document,
        );
        self.observations.insert_observations(&observations).await
    }
}

/// Similarities between two samples, clamped to `[0, 1]`.
pub fn observe(
    run_id: Uuid,
    seed: i64,
    sources: &[ClaimEmbedding],
    dests: &[ClaimEmbedding],
    exclude_same_document: bool,
) -> Vec<SimilarityObservation> {
    let dest_norms: Vec<f32> = dests.iter().map(|d| norm(d.vector.as_slice())).collect();
    let mut out = Vec::with_capacity(sources.len() * dests.len());
    for source in sources {
        let sv = source.vector.as_slice();
        let source_norm = norm(sv);
        for (dest, dest_norm) in dests.iter().zip(&dest_norms) {
            if dest.id == source.id
                || (exclude_same_document && dest.document_id == source.document_id)
            {
                continue;
            }
            let similarity =
                cosine_with_norms(sv, dest.vector.as_slice(), source_norm, *dest_norm);
            out.push(SimilarityObservation {
                run_id,
                similarity: clamp_unit(similarity),
                source_claim_id: Some(source.id),
                dest_claim_id: Some(dest.id),
                seed,
                sampling_policy: SAMPLING_POLICY.to_string(),
            });
        }
    }
    out
}

/// `(source_sample × dest_sample × rounds) / N²`.
pub fn coverage(source_sample: i64, dest_sample: i64, rounds: i32, corpus_size: i64) -> f64 {
    if corpus_size <= 0 {
        return 0.0;
    }
    let n = corpus_size as f64;
    (source_sample as f64 * dest_sample as f64 * rounds as f64) / (n * n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serendip_core::{InMemoryStore, NewClaim, Vector};

    async fn seeded_store(documents: usize, per_document: usize) -> InMemoryStore {
        let store = InMemoryStore::with_seed(11);
        let mut i = 0f32;
        for _ in 0..documents {
            let document_id = Uuid::new_v4();
            for _ in 0..per_document {
                i += 1.0;
                store
                    .insert_claim(NewClaim {
                        document_id,
                        text: String::new(),
                        vector: Vector::from(vec![
                            1.0,
                            (i * 0.3).sin().abs(),
                            (i * 0.7).cos().abs(),
                        ]),
                    })
                    .await
                    .unwrap();
            }
        }
        store
    }

    #[test]
    fn test_coverage_formula() {
        assert!((coverage(400, 400, 4, 1000) - 0.64).abs() < 1e-12);
        assert_eq!(coverage(1, 1, 1, 0), 0.0);
    }

    #[tokio::test]
    async fn test_empty_corpus_fails_fast() {
        let stores = Stores::from_store(InMemoryStore::new());
        let builder = DistributionSketchBuilder::new(&stores, WorkBudget::default());
        let failure = builder.build(&SketchParams::default()).await.unwrap_err();
        assert!(matches!(failure.source, Error::InsufficientData(_)));
        assert_eq!(failure.observations_persisted, 0);
    }

    #[tokio::test]
    async fn test_round_past_deadline_times_out_without_observations() {
        let store = seeded_store(4, 5).await;
        store
            .set_read_latency(std::time::Duration::from_millis(200))
            .unwrap();
        let stores = Stores::from_store(store.clone());
        let budget = WorkBudget::default().with_limit(std::time::Duration::from_millis(20));
        let builder = DistributionSketchBuilder::new(&stores, budget);

        let failure = builder.build(&SketchParams::default()).await.unwrap_err();
        assert!(matches!(failure.source, Error::Timeout(20)));
        assert_eq!(failure.rounds_completed, 0);
        assert_eq!(failure.observations_persisted, 0);
        assert!(store.all_observations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sketch_writes_bounded_clamped_observations() {
        let store = seeded_store(6, 5).await;
        let stores = Stores::from_store(store.clone());
        let builder = DistributionSketchBuilder::new(&stores, WorkBudget::default());
        let params = SketchParams {
            seed: 42,
            source_sample: 8,
            dest_sample: 10,
            rounds: 3,
            exclude_same_document: true,
        };

        let report = builder.build(&params).await.unwrap();
        assert_eq!(report.rounds, 3);
        assert!(report.observation_count > 0);
        assert!(report.observation_count <= 8 * 10 * 3);

        let observations = store.all_observations().unwrap();
        assert_eq!(observations.len() as u64, report.observation_count);
        assert!(observations.iter().all(|o| o.run_id == report.run_id));
        assert!(observations
            .iter()
            .all(|o| (0.0..=1.0).contains(&o.similarity)));
        assert!(observations
            .iter()
            .all(|o| o.source_claim_id != o.dest_claim_id));
    }

    #[tokio::test]
    async fn test_sketch_is_reproducible_for_a_seed() {
        let store = seeded_store(4, 5).await;
        let stores = Stores::from_store(store.clone());
        let builder = DistributionSketchBuilder::new(&stores, WorkBudget::default());
        let params = SketchParams {
            source_sample: 5,
            dest_sample: 5,
            rounds: 2,
            ..Default::default()
        };

        let first = builder.build(&params).await.unwrap();
        let second = builder.build(&params).await.unwrap();
        let pairs = |run_id: Uuid| -> Vec<(Option<i64>, Option<i64>)> {
            store
                .all_observations()
                .unwrap()
                .into_iter()
                .filter(|o| o.run_id == run_id)
                .map(|o| (o.source_claim_id, o.dest_claim_id))
                .collect()
        };
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(pairs(first.run_id), pairs(second.run_id));
    }
}
