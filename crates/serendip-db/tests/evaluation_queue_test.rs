//! Integration tests for the evaluation queue and tiered retrieval.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database and
//! must run serially: `cargo test -p serendip-db -- --ignored --test-threads=1`

use chrono::{Duration, Utc};
use serendip_db::test_fixtures::{TestCorpusBuilder, TestDatabase};
use serendip_db::{
    CandidateRepository, Database, EvaluationQueue, EvaluationStatus, NewCandidatePair,
    QualityTier,
};

/// Insert every cross-document pair of a small fixture corpus.
async fn seed_pairs(db: &Database) -> usize {
    let claims = TestCorpusBuilder::new(db).with_documents(3, 2).await.build();
    let mut pairs = Vec::new();
    for (i, (x, doc_x)) in claims.iter().enumerate() {
        for (y, doc_y) in claims.iter().skip(i + 1) {
            if doc_x != doc_y {
                pairs.push(NewCandidatePair {
                    claim_a: *x.min(y),
                    claim_b: *x.max(y),
                    similarity: 0.2,
                    document_a: if x < y { *doc_x } else { *doc_y },
                    document_b: if x < y { *doc_y } else { *doc_x },
                    run_id: None,
                });
            }
        }
    }
    db.candidates.commit_batch(&pairs, None).await.unwrap() as usize
}

#[tokio::test]
#[ignore]
async fn test_claim_moves_pairs_to_processing() {
    let test_db = TestDatabase::new().await;
    let total = seed_pairs(&test_db.db).await;
    assert_eq!(total, 12);

    let claimed = test_db.db.candidates.claim_for_evaluation(5).await.unwrap();
    assert_eq!(claimed.len(), 5);
    assert!(claimed
        .iter()
        .all(|p| p.status == EvaluationStatus::Processing));
    assert_eq!(
        test_db.db.candidates.pending_evaluation_count().await.unwrap(),
        7
    );

    // Already-claimed pairs are not handed out again.
    let next = test_db.db.candidates.claim_for_evaluation(100).await.unwrap();
    assert_eq!(next.len(), 7);
    assert!(next.iter().all(|p| !claimed.iter().any(|c| c.id == p.id)));
}

#[tokio::test]
#[ignore]
async fn test_complete_assigns_tier_and_feeds_retrieval() {
    let test_db = TestDatabase::new().await;
    seed_pairs(&test_db.db).await;
    let claimed = test_db.db.candidates.claim_for_evaluation(3).await.unwrap();

    let scores = [91.0, 88.0, 40.0];
    for (pair, score) in claimed.iter().zip(scores) {
        test_db
            .db
            .candidates
            .complete_evaluation(pair.id, score)
            .await
            .unwrap();
    }

    let excellent = test_db
        .db
        .candidates
        .scored_unused(QualityTier::Excellent, 10)
        .await
        .unwrap();
    assert_eq!(excellent.len(), 2);
    assert_eq!(excellent[0].score, Some(91.0));

    test_db.db.candidates.mark_used(excellent[0].id).await.unwrap();
    let excellent = test_db
        .db
        .candidates
        .scored_unused(QualityTier::Excellent, 10)
        .await
        .unwrap();
    assert_eq!(excellent.len(), 1);

    let below_floor = test_db
        .db
        .candidates
        .get_candidate(claimed[2].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(below_floor.status, EvaluationStatus::Completed);
    assert_eq!(below_floor.quality_tier, None);
}

#[tokio::test]
#[ignore]
async fn test_failed_evaluation_retries_until_cap() {
    let test_db = TestDatabase::new().await;
    seed_pairs(&test_db.db).await;

    let id = test_db.db.candidates.claim_for_evaluation(1).await.unwrap()[0].id;
    let status = test_db
        .db
        .candidates
        .fail_evaluation(id, "evaluator timeout", 2)
        .await
        .unwrap();
    assert_eq!(status, EvaluationStatus::Pending);

    // Reclaim the same pair: it is the oldest pending one.
    let again = test_db.db.candidates.claim_for_evaluation(1).await.unwrap();
    assert_eq!(again[0].id, id);
    let status = test_db
        .db
        .candidates
        .fail_evaluation(id, "evaluator timeout", 2)
        .await
        .unwrap();
    assert_eq!(status, EvaluationStatus::Failed);

    let pair = test_db.db.candidates.get_candidate(id).await.unwrap().unwrap();
    assert_eq!(pair.attempts, 2);
    assert_eq!(pair.last_error.as_deref(), Some("evaluator timeout"));
}

#[tokio::test]
#[ignore]
async fn test_release_stale_returns_abandoned_claims() {
    let test_db = TestDatabase::new().await;
    seed_pairs(&test_db.db).await;
    test_db.db.candidates.claim_for_evaluation(4).await.unwrap();

    let none = test_db
        .db
        .candidates
        .release_stale(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(none, 0);

    let released = test_db
        .db
        .candidates
        .release_stale(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(released, 4);
    assert_eq!(
        test_db.db.candidates.pending_evaluation_count().await.unwrap(),
        12
    );
}
