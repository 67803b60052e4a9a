//! Mining run lifecycle.
//!
//! A run walks the corpus in claim-id order, one miner invocation per batch.
//! The run's progress row holds the cursor, so a run interrupted at any point
//! resumes from its last committed batch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use serendip_core::sampling::batch_seed;
use serendip_core::{Error, MiningParams, MiningProgress, ProgressRepository, Result, RunStatus};

use crate::config::{RunnerConfig, WorkBudget};
use crate::miner::{CandidateMiner, MineReport, MineRequest, MiningFailure};
use crate::stores::Stores;

/// Result of one `run_batch` call.
#[derive(Debug)]
pub enum BatchOutcome {
    /// A batch was committed and the cursor moved.
    Advanced(MineReport),
    /// No sources remained; the run is now completed.
    Completed(MineReport),
    /// The batch failed and nothing was written. `run_failed` is set when
    /// this failure exhausted the run's failure allowance or cannot succeed
    /// on retry.
    Failed {
        failure: MiningFailure,
        run_failed: bool,
    },
}

/// Totals of a `run_until_complete` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub batches: usize,
    pub failed_batches: usize,
    pub pairs_inserted: u64,
    pub cursor: i64,
}

/// Drives mining runs batch by batch.
pub struct MiningRunner {
    progress: Arc<dyn ProgressRepository>,
    miner: CandidateMiner,
    config: RunnerConfig,
}

impl MiningRunner {
    pub fn new(stores: &Stores, budget: WorkBudget, config: RunnerConfig) -> Self {
        Self {
            progress: stores.progress.clone(),
            miner: CandidateMiner::new(stores, budget),
            config,
        }
    }

    /// Start a fresh run. Fails with `Error::ConcurrentRun` while another run
    /// is in progress.
    pub async fn start(&self, params: &MiningParams) -> Result<MiningProgress> {
        params.validate()?;
        let run = self.progress.start_run(params, None).await?;
        info!(
            subsystem = "mining",
            component = "runner",
            op = "start",
            run_id = %run.id,
            seed = run.params.seed,
            "Mining run started"
        );
        Ok(run)
    }

    /// Start a run continuing a paused or failed one from its cursor.
    pub async fn resume_from(&self, previous: Uuid) -> Result<MiningProgress> {
        let run = self
            .progress
            .start_run(&MiningParams::default(), Some(previous))
            .await?;
        info!(
            subsystem = "mining",
            component = "runner",
            op = "resume",
            run_id = %run.id,
            resumed_from = %previous,
            cursor = run.last_source_id,
            "Mining run resumed"
        );
        Ok(run)
    }

    /// Mine the next batch of `run_id` with the run's own parameter snapshot.
    pub async fn run_batch(&self, run_id: Uuid) -> Result<BatchOutcome> {
        let run = self
            .progress
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound(run_id))?;
        if run.status != RunStatus::InProgress {
            return Err(Error::InvalidState(format!(
                "run {run_id} is {}, not in_progress",
                run.status
            )));
        }

        let request = MineRequest {
            cursor: run.last_source_id,
            seed: batch_seed(run.params.seed, run.last_source_id),
            params: run.params.clone(),
            run_id: Some(run_id),
        };

        match self.miner.mine(&request).await {
            Ok(report) if report.completed => {
                self.progress.complete(run_id).await?;
                info!(
                    subsystem = "mining",
                    component = "runner",
                    op = "complete",
                    run_id = %run_id,
                    cursor = report.cursor,
                    batches = run.batches,
                    pairs_inserted = run.pairs_inserted,
                    "Mining run completed"
                );
                Ok(BatchOutcome::Completed(report))
            }
            Ok(report) => Ok(BatchOutcome::Advanced(report)),
            Err(failure) => {
                let reason = failure.to_string();
                let updated = self.progress.record_failure(run_id, &reason).await?;
                let run_failed = !failure.source.is_retriable()
                    || updated.consecutive_failures >= self.config.max_consecutive_failures;
                if run_failed {
                    self.progress.fail(run_id, &reason).await?;
                    error!(
                        subsystem = "mining",
                        component = "runner",
                        run_id = %run_id,
                        consecutive_failures = updated.consecutive_failures,
                        retriable = failure.source.is_retriable(),
                        "Mining run failed"
                    );
                } else {
                    warn!(
                        subsystem = "mining",
                        component = "runner",
                        run_id = %run_id,
                        consecutive_failures = updated.consecutive_failures,
                        cursor = updated.last_source_id,
                        "Batch failed, will retry from cursor"
                    );
                }
                Ok(BatchOutcome::Failed {
                    failure,
                    run_failed,
                })
            }
        }
    }

    /// Run batches until the run completes, fails, or `max_batches` have been
    /// attempted. A run that has already finished is reported as is.
    pub async fn run_until_complete(
        &self,
        run_id: Uuid,
        max_batches: Option<usize>,
    ) -> Result<RunSummary> {
        let mut batches = 0usize;
        let mut failed_batches = 0usize;
        let mut pairs_inserted = 0u64;

        let initial = self.status(run_id).await?;
        if initial.status.is_terminal() {
            info!(
                subsystem = "mining",
                component = "runner",
                run_id = %run_id,
                status = %initial.status,
                "Run already finished, nothing to mine"
            );
            return Ok(RunSummary {
                run_id,
                status: initial.status,
                batches,
                failed_batches,
                pairs_inserted,
                cursor: initial.last_source_id,
            });
        }

        while max_batches.map_or(true, |max| batches + failed_batches < max) {
            match self.run_batch(run_id).await? {
                BatchOutcome::Advanced(report) => {
                    batches += 1;
                    pairs_inserted += report.pairs_inserted;
                }
                BatchOutcome::Completed(_) => break,
                BatchOutcome::Failed { run_failed, .. } => {
                    failed_batches += 1;
                    if run_failed {
                        break;
                    }
                }
            }
        }

        let run = self.status(run_id).await?;
        Ok(RunSummary {
            run_id,
            status: run.status,
            batches,
            failed_batches,
            pairs_inserted,
            cursor: run.last_source_id,
        })
    }

    /// Pause an in-progress run; it can later be resumed with `resume_from`.
    pub async fn pause(&self, run_id: Uuid) -> Result<MiningProgress> {
        let run = self.progress.pause(run_id).await?;
        info!(
            subsystem = "mining",
            component = "runner",
            op = "pause",
            run_id = %run_id,
            cursor = run.last_source_id,
            "Mining run paused"
        );
        Ok(run)
    }

    pub async fn status(&self, run_id: Uuid) -> Result<MiningProgress> {
        self.progress
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serendip_core::{ClaimCorpus, InMemoryStore, NewClaim, Vector};

    async fn store_with_claims(claims: usize) -> InMemoryStore {
        let store = InMemoryStore::with_seed(3);
        let mut document_id = Uuid::new_v4();
        for i in 0..claims {
            if i % 4 == 0 {
                document_id = Uuid::new_v4();
            }
            let x = i as f32 / claims as f32;
            store
                .insert_claim(NewClaim {
                    document_id,
                    text: String::new(),
                    vector: Vector::from(vec![1.0 - x, x, 0.3]),
                })
                .await
                .unwrap();
        }
        store
    }

    fn params() -> MiningParams {
        MiningParams {
            source_batch_size: 8,
            dest_sample_size: 40,
            per_source_quota: 3,
            ..Default::default()
        }
    }

    fn runner(store: &InMemoryStore) -> MiningRunner {
        MiningRunner::new(
            &Stores::from_store(store.clone()),
            WorkBudget::default(),
            RunnerConfig {
                max_consecutive_failures: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_run_advances_cursor_monotonically_until_completed() {
        let store = store_with_claims(40).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();

        let mut last_cursor = 0;
        loop {
            match runner.run_batch(run.id).await.unwrap() {
                BatchOutcome::Advanced(report) => {
                    assert!(report.cursor > last_cursor);
                    last_cursor = report.cursor;
                }
                BatchOutcome::Completed(_) => break,
                BatchOutcome::Failed { failure, .. } => panic!("unexpected failure: {failure}"),
            }
        }

        let finished = runner.status(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.last_source_id, 40);
        assert_eq!(finished.sources_processed, 40);
        assert_eq!(finished.batches, 5);
        assert_eq!(
            finished.pairs_inserted,
            store.all_candidates().unwrap().len() as i64
        );
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_one_is_active() {
        let store = store_with_claims(10).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();
        let err = runner.start(&params()).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentRun(id) if id == run.id));
    }

    #[tokio::test]
    async fn test_paused_run_resumes_from_its_cursor() {
        let store = store_with_claims(32).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();
        runner.run_batch(run.id).await.unwrap();
        let paused = runner.pause(run.id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(paused.last_source_id, 8);

        let resumed = runner.resume_from(run.id).await.unwrap();
        assert_eq!(resumed.last_source_id, 8);
        assert_eq!(resumed.params, params());
        assert_eq!(resumed.resumed_from, Some(run.id));

        let summary = runner.run_until_complete(resumed.id, None).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.cursor, store.max_claim_id().await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_repeated_failures_fail_the_run_without_moving_cursor() {
        let store = store_with_claims(16).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();

        store.fail_next_commit().unwrap();
        match runner.run_batch(run.id).await.unwrap() {
            BatchOutcome::Failed { run_failed, .. } => assert!(!run_failed),
            other => panic!("expected failure, got {other:?}"),
        }
        store.fail_next_commit().unwrap();
        match runner.run_batch(run.id).await.unwrap() {
            BatchOutcome::Failed { run_failed, .. } => assert!(run_failed),
            other => panic!("expected failure, got {other:?}"),
        }

        let failed = runner.status(run.id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.last_source_id, 0);
        assert!(failed.last_error.is_some());
        assert!(store.all_candidates().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let store = store_with_claims(24).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();

        store.fail_next_commit().unwrap();
        runner.run_batch(run.id).await.unwrap();
        assert!(matches!(
            runner.run_batch(run.id).await.unwrap(),
            BatchOutcome::Advanced(_)
        ));
        let status = runner.status(run.id).await.unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn test_finished_run_is_reported_without_mining() {
        let store = store_with_claims(16).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();
        runner.run_batch(run.id).await.unwrap();
        runner.pause(run.id).await.unwrap();

        let summary = runner.run_until_complete(run.id, None).await.unwrap();
        assert_eq!(summary.status, RunStatus::Paused);
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.cursor, 8);
        assert!(matches!(
            runner.run_batch(run.id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_max_batches_bounds_the_loop() {
        let store = store_with_claims(40).await;
        let runner = runner(&store);
        let run = runner.start(&params()).await.unwrap();
        let summary = runner.run_until_complete(run.id, Some(2)).await.unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.status, RunStatus::InProgress);
        assert_eq!(summary.cursor, 16);
    }
}
