//! Candidate miner.
//!
//! One invocation mines one source batch:
//!
//! 1. Fetch the next `source_batch_size` claims after the cursor (keyset).
//! 2. For up to `max_rounds` rounds, sample `dest_sample_size` destinations
//!    from a seeded `sample_key` range, score the cross product, derive the
//!    acceptance band, and keep each source's lowest-similarity in-band pairs
//!    until its quota `K` is filled.
//! 3. Stop early once the accepted pairs reach `early_stop_ratio` of
//!    `source_batch_size × K`.
//! 4. Insert the accepted pairs if absent and advance the cursor, in one
//!    transaction.
//!
//! Any error leaves nothing written and the cursor where it was, so the same
//! batch is retried by the next invocation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use serendip_core::sampling::{next_round_seed, range_start};
use serendip_core::{
    BandSource, CandidateRepository, ClaimCorpus, ClaimEmbedding, ClaimId, DistributionRepository,
    Error, MiningParams, NewCandidatePair, ProgressAdvance, Result,
};

use crate::band::{cross_similarities, global_band, local_band, select_top_k, Band};
use crate::config::WorkBudget;
use crate::stores::Stores;

/// Input of one mining invocation.
#[derive(Debug, Clone)]
pub struct MineRequest {
    /// Last source id already mined; sources start strictly after it.
    pub cursor: ClaimId,
    pub params: MiningParams,
    /// Seed of the first round of this batch.
    pub seed: i64,
    /// Run whose progress is advanced with the batch, if any.
    pub run_id: Option<Uuid>,
}

/// One round of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: u32,
    pub seed: i64,
    pub dest_count: usize,
    pub edge_count: usize,
    /// Band used for the round; `None` when the round had nothing to score.
    pub band: Option<Band>,
    pub accepted: usize,
}

/// A pair accepted by a batch together with the round that accepted it.
#[derive(Debug, Clone)]
pub struct AcceptedPair {
    pub round: u32,
    /// Batch source whose quota the pair counts against.
    pub source: ClaimId,
    pub pair: NewCandidatePair,
}

/// Outcome of a successful invocation.
#[derive(Debug, Clone, Serialize)]
pub struct MineReport {
    pub sources_processed: usize,
    /// Pairs accepted by the rounds, whether or not they were already stored.
    pub pairs_accepted: usize,
    /// Pairs newly written.
    pub pairs_inserted: u64,
    pub rounds: Vec<RoundReport>,
    pub avg_candidates_per_source: f64,
    /// Cursor after the batch; unchanged when `completed`.
    pub cursor: ClaimId,
    /// No sources remained after the input cursor.
    pub completed: bool,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub accepted: Vec<AcceptedPair>,
}

impl MineReport {
    fn exhausted(cursor: ClaimId, started: Instant) -> Self {
        Self {
            sources_processed: 0,
            pairs_accepted: 0,
            pairs_inserted: 0,
            rounds: Vec::new(),
            avg_candidates_per_source: 0.0,
            cursor,
            completed: true,
            elapsed_ms: started.elapsed().as_millis() as u64,
            accepted: Vec::new(),
        }
    }

    /// Bands realised by the rounds, in round order.
    pub fn bands(&self) -> impl Iterator<Item = &Band> {
        self.rounds.iter().filter_map(|r| r.band.as_ref())
    }
}

/// A failed invocation. Nothing was written and the cursor did not move.
#[derive(Debug, thiserror::Error)]
#[error("mining failed at cursor {cursor} after {rounds_reached} rounds: {source}")]
pub struct MiningFailure {
    /// Last good cursor; the next invocation retries from here.
    pub cursor: ClaimId,
    pub rounds_reached: u32,
    /// Band of the last round that produced one.
    pub band: Option<Band>,
    #[source]
    pub source: Error,
}

/// Mines candidate pairs batch by batch.
pub struct CandidateMiner {
    corpus: Arc<dyn ClaimCorpus>,
    candidates: Arc<dyn CandidateRepository>,
    distribution: Arc<dyn DistributionRepository>,
    budget: WorkBudget,
}

struct Batch {
    sources: Vec<ClaimEmbedding>,
    rounds: Vec<RoundReport>,
    accepted: Vec<AcceptedPair>,
    last_band: Option<Band>,
}

impl CandidateMiner {
    pub fn new(stores: &Stores, budget: WorkBudget) -> Self {
        Self {
            corpus: stores.corpus.clone(),
            candidates: stores.candidates.clone(),
            distribution: stores.distribution.clone(),
            budget,
        }
    }

    /// Mine one source batch.
    pub async fn mine(
        &self,
        request: &MineRequest,
    ) -> std::result::Result<MineReport, MiningFailure> {
        let started = Instant::now();
        let mut batch = Batch {
            sources: Vec::new(),
            rounds: Vec::new(),
            accepted: Vec::new(),
            last_band: None,
        };

        let outcome = tokio::time::timeout(
            self.budget.remaining(started),
            self.select_pairs(request, started, &mut batch),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(self.budget.limit.as_millis() as u64)));

        let result = match outcome {
            Ok(()) if batch.sources.is_empty() => {
                info!(
                    subsystem = "mining",
                    component = "miner",
                    op = "mine",
                    cursor = request.cursor,
                    "No sources remain after cursor"
                );
                return Ok(MineReport::exhausted(request.cursor, started));
            }
            Ok(()) => self.commit(request, &batch).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((cursor, inserted)) => {
                let report = self.report(request, batch, cursor, inserted, started);
                info!(
                    subsystem = "mining",
                    component = "miner",
                    op = "mine",
                    run_id = ?request.run_id,
                    cursor = report.cursor,
                    source_count = report.sources_processed,
                    pairs_accepted = report.pairs_accepted,
                    pairs_inserted = report.pairs_inserted,
                    rounds = report.rounds.len(),
                    duration_ms = report.elapsed_ms,
                    "Batch mined"
                );
                Ok(report)
            }
            Err(source) => {
                let failure = MiningFailure {
                    cursor: request.cursor,
                    rounds_reached: batch.rounds.len() as u32,
                    band: batch.last_band,
                    source,
                };
                error!(
                    subsystem = "mining",
                    component = "miner",
                    op = "mine",
                    run_id = ?request.run_id,
                    cursor = failure.cursor,
                    round = failure.rounds_reached,
                    error = %failure.source,
                    "Batch failed, cursor not advanced"
                );
                Err(failure)
            }
        }
    }

    /// Steps 1 and 2: sources and the round loop. Writes nothing.
    async fn select_pairs(
        &self,
        request: &MineRequest,
        started: Instant,
        batch: &mut Batch,
    ) -> Result<()> {
        let params = &request.params;
        params.validate()?;

        batch.sources = self
            .corpus
            .next_sources(request.cursor, params.source_batch_size)
            .await?;
        if batch.sources.is_empty() {
            return Ok(());
        }

        let global = match params.band_source {
            BandSource::Local => None,
            BandSource::Global => {
                let snapshot = self.distribution.current_snapshot().await?;
                let band = snapshot
                    .as_ref()
                    .and_then(|s| global_band(s, params.band_low, params.band_high));
                if band.is_none() {
                    warn!(
                        subsystem = "mining",
                        component = "miner",
                        "No distribution snapshot, falling back to per-round bands"
                    );
                }
                band
            }
        };

        let quota = params.per_source_quota.max(0) as usize;
        let max_pairs = params.max_pairs_per_batch() as f64;
        let target = (max_pairs * params.early_stop_ratio).ceil() as usize;
        let mut remaining = vec![quota; batch.sources.len()];
        let mut taken = HashSet::new();
        let mut seed = request.seed;

        for round in 1..=params.max_rounds.max(0) as u32 {
            if round > 1 && self.budget.soft_exceeded(started) {
                warn!(
                    subsystem = "mining",
                    component = "miner",
                    round,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Soft time budget spent, no further rounds"
                );
                break;
            }

            let dests = self
                .corpus
                .sample_range(range_start(seed), params.dest_sample_size)
                .await?;
            let edges = cross_similarities(&batch.sources, &dests);
            let band = global.or_else(|| local_band(&edges, params.band_low, params.band_high));

            let picked = match &band {
                Some(band) => select_top_k(&edges, band, &mut remaining, &mut taken),
                None => Vec::new(),
            };
            for edge in &picked {
                let source = &batch.sources[edge.source];
                let dest = &dests[edge.dest];
                if let Some(pair) =
                    NewCandidatePair::from_claims(source, dest, edge.similarity, request.run_id)
                {
                    batch.accepted.push(AcceptedPair {
                        round,
                        source: source.id,
                        pair,
                    });
                }
            }

            debug!(
                subsystem = "mining",
                component = "miner",
                op = "round",
                round,
                dest_count = dests.len(),
                band_low = band.map(|b| b.low),
                band_high = band.map(|b| b.high),
                accepted = picked.len(),
                "Round complete"
            );
            batch.rounds.push(RoundReport {
                round,
                seed,
                dest_count: dests.len(),
                edge_count: edges.len(),
                band,
                accepted: picked.len(),
            });
            if band.is_some() {
                batch.last_band = band;
            }

            if batch.accepted.len() >= target {
                break;
            }
            seed = next_round_seed(seed);
        }

        if batch.accepted.len() < target {
            warn!(
                subsystem = "mining",
                component = "miner",
                cursor = request.cursor,
                pairs_accepted = batch.accepted.len(),
                target,
                rounds = batch.rounds.len(),
                "Quota shortfall for batch"
            );
        }
        Ok(())
    }

    /// Steps 3 and 4: one transaction for the inserts and the cursor advance.
    async fn commit(&self, request: &MineRequest, batch: &Batch) -> Result<(ClaimId, u64)> {
        let cursor = batch
            .sources
            .iter()
            .map(|s| s.id)
            .max()
            .unwrap_or(request.cursor);
        let pairs: Vec<NewCandidatePair> = batch.accepted.iter().map(|a| a.pair.clone()).collect();
        let advance = request.run_id.map(|run_id| ProgressAdvance {
            run_id,
            cursor,
            sources_processed: batch.sources.len() as i64,
            pairs_inserted: 0,
        });
        let inserted = self.candidates.commit_batch(&pairs, advance).await?;
        Ok((cursor, inserted))
    }

    fn report(
        &self,
        request: &MineRequest,
        batch: Batch,
        cursor: ClaimId,
        inserted: u64,
        started: Instant,
    ) -> MineReport {
        let sources = batch.sources.len();
        MineReport {
            sources_processed: sources,
            pairs_accepted: batch.accepted.len(),
            pairs_inserted: inserted,
            avg_candidates_per_source: if sources == 0 {
                0.0
            } else {
                batch.accepted.len() as f64 / sources as f64
            },
            rounds: batch.rounds,
            cursor: cursor.max(request.cursor),
            completed: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
            accepted: batch.accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use serendip_core::{InMemoryStore, NewClaim, ProgressRepository, Vector};

    /// Claims on a circle so that similarity falls off with index distance;
    /// `per_document` consecutive claims share a document.
    async fn ring_store(claims: usize, per_document: usize) -> InMemoryStore {
        let store = InMemoryStore::with_seed(7);
        let mut document_id = Uuid::new_v4();
        for i in 0..claims {
            if i % per_document == 0 {
                document_id = Uuid::new_v4();
            }
            let angle = i as f32 * std::f32::consts::PI / claims as f32;
            store
                .insert_claim(NewClaim {
                    document_id,
                    text: format!("claim {i}"),
                    vector: Vector::from(vec![angle.cos(), angle.sin(), 0.5]),
                })
                .await
                .unwrap();
        }
        store
    }

    fn request(cursor: ClaimId, params: MiningParams) -> MineRequest {
        MineRequest {
            cursor,
            seed: params.seed,
            params,
            run_id: None,
        }
    }

    fn small_params() -> MiningParams {
        MiningParams {
            source_batch_size: 10,
            dest_sample_size: 60,
            per_source_quota: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mined_pairs_are_canonical_cross_document_and_in_band() {
        let store = ring_store(120, 3).await;
        let stores = Stores::from_store(store.clone());
        let miner = CandidateMiner::new(&stores, WorkBudget::default());

        let report = miner.mine(&request(0, small_params())).await.unwrap();
        assert_eq!(report.sources_processed, 10);
        assert_eq!(report.cursor, 10);
        assert!(report.pairs_inserted > 0);
        assert!(report.pairs_accepted <= 10 * 4);

        for accepted in &report.accepted {
            let pair = &accepted.pair;
            assert!(pair.claim_a < pair.claim_b);
            assert_ne!(pair.document_a, pair.document_b);
            let band = report.rounds[accepted.round as usize - 1].band.unwrap();
            assert!(band.contains(pair.similarity));
        }
        let stored = store.all_candidates().unwrap();
        assert_eq!(stored.len() as u64, report.pairs_inserted);
    }

    #[tokio::test]
    async fn test_mining_same_range_twice_inserts_nothing_new() {
        let store = ring_store(90, 3).await;
        let stores = Stores::from_store(store.clone());
        let miner = CandidateMiner::new(&stores, WorkBudget::default());

        let first = miner.mine(&request(0, small_params())).await.unwrap();
        let second = miner.mine(&request(0, small_params())).await.unwrap();
        assert!(first.pairs_inserted > 0);
        assert_eq!(second.pairs_inserted, 0);
        assert_eq!(second.pairs_accepted, first.pairs_accepted);
    }

    #[tokio::test]
    async fn test_exhausted_cursor_reports_completion() {
        let store = ring_store(30, 3).await;
        let stores = Stores::from_store(store);
        let miner = CandidateMiner::new(&stores, WorkBudget::default());

        let report = miner.mine(&request(30, small_params())).await.unwrap();
        assert!(report.completed);
        assert_eq!(report.cursor, 30);
        assert_eq!(report.sources_processed, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_cursor_and_writes_nothing() {
        let store = ring_store(60, 3).await;
        let stores = Stores::from_store(store.clone());
        let miner = CandidateMiner::new(&stores, WorkBudget::default());
        store.fail_next_commit().unwrap();

        let failure = miner.mine(&request(0, small_params())).await.unwrap_err();
        assert_eq!(failure.cursor, 0);
        assert!(failure.rounds_reached >= 1);
        assert!(failure.band.is_some());
        assert!(store.all_candidates().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_past_deadline_times_out_and_keeps_cursor() {
        let store = ring_store(60, 3).await;
        let run = store.start_run(&small_params(), None).await.unwrap();
        store.set_read_latency(Duration::from_millis(200)).unwrap();
        let stores = Stores::from_store(store.clone());
        let budget = WorkBudget::default().with_limit(Duration::from_millis(20));
        let miner = CandidateMiner::new(&stores, budget);
        let request = MineRequest {
            run_id: Some(run.id),
            ..request(0, small_params())
        };

        let failure = miner.mine(&request).await.unwrap_err();
        assert!(matches!(failure.source, Error::Timeout(20)));
        assert_eq!(failure.cursor, 0);
        assert!(store.all_candidates().unwrap().is_empty());
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.last_source_id, 0);
        assert_eq!(run.sources_processed, 0);
    }

    #[tokio::test]
    async fn test_early_stop_after_half_the_batch_quota() {
        let store = ring_store(200, 3).await;
        let stores = Stores::from_store(store);
        let miner = CandidateMiner::new(&stores, WorkBudget::default());
        // Ten sources with a quota of 20 cannot fill all 200 slots from one
        // 60-claim sample, but easily reach half of them.
        let params = MiningParams {
            source_batch_size: 10,
            dest_sample_size: 60,
            per_source_quota: 20,
            max_rounds: 3,
            ..Default::default()
        };
        assert_eq!(params.early_stop_ratio, 0.5);

        let report = miner.mine(&request(0, params.clone())).await.unwrap();
        assert_eq!(report.rounds.len(), 1);
        assert!(report.pairs_accepted >= 100);
        assert!(report.pairs_accepted < 200);

        let full_target = MiningParams {
            early_stop_ratio: 1.0,
            ..params
        };
        let report = miner.mine(&request(0, full_target)).await.unwrap();
        assert!(report.rounds.len() >= 2);
    }

    #[tokio::test]
    async fn test_invalid_params_fail_without_rounds() {
        let store = ring_store(20, 2).await;
        let stores = Stores::from_store(store);
        let miner = CandidateMiner::new(&stores, WorkBudget::default());
        let params = MiningParams {
            band_low: 0.6,
            band_high: 0.2,
            ..Default::default()
        };

        let failure = miner.mine(&request(0, params)).await.unwrap_err();
        assert!(matches!(failure.source, Error::InvalidInput(_)));
        assert_eq!(failure.rounds_reached, 0);
    }

    #[tokio::test]
    async fn test_per_source_quota_holds_across_rounds() {
        let store = ring_store(80, 2).await;
        let stores = Stores::from_store(store);
        let miner = CandidateMiner::new(&stores, WorkBudget::default());
        // A full-quota early-stop target keeps later rounds running.
        let params = MiningParams {
            early_stop_ratio: 1.0,
            dest_sample_size: 8,
            max_rounds: 3,
            ..small_params()
        };

        let report = miner.mine(&request(0, params)).await.unwrap();
        assert!(report.rounds.len() >= 2);
        let mut per_source = std::collections::HashMap::new();
        for accepted in &report.accepted {
            *per_source.entry(accepted.source).or_insert(0) += 1;
        }
        assert!(per_source.values().all(|&n| n <= 4));
    }

    #[tokio::test]
    async fn test_global_band_falls_back_to_local_without_snapshot() {
        let store = ring_store(60, 3).await;
        let stores = Stores::from_store(store);
        let miner = CandidateMiner::new(&stores, WorkBudget::default());
        let params = MiningParams {
            band_source: BandSource::Global,
            ..small_params()
        };

        let report = miner.mine(&request(0, params)).await.unwrap();
        assert!(report.bands().count() >= 1);
        assert!(report.pairs_inserted > 0);
    }
}
