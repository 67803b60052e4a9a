//! Candidate pair repository and evaluation queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use serendip_core::defaults::SCORE_MAX;
use serendip_core::{
    new_v7, CandidatePair, CandidateRepository, Error, EvaluationQueue,
    EvaluationStatus, NewCandidatePair, ProgressAdvance, QualityTier, Result,
};

use crate::progress::advance_in_tx;

const CANDIDATE_COLUMNS: &str = "id, claim_a, claim_b, similarity, document_a, document_b, \
     run_id, status, attempts, score, quality_tier, last_error, used, created_at, evaluated_at";

/// PostgreSQL implementation of CandidateRepository and EvaluationQueue.
#[derive(Clone)]
pub struct PgCandidateRepository {
    pool: Pool<Postgres>,
}

impl PgCandidateRepository {
    /// Create a new PgCandidateRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> Result<CandidatePair> {
        let status: String = row.get("status");
        let tier: Option<String> = row.get("quality_tier");
        Ok(CandidatePair {
            id: row.get("id"),
            claim_a: row.get("claim_a"),
            claim_b: row.get("claim_b"),
            similarity: row.get("similarity"),
            document_a: row.get("document_a"),
            document_b: row.get("document_b"),
            run_id: row.get("run_id"),
            status: status.parse()?,
            attempts: row.get("attempts"),
            score: row.get("score"),
            quality_tier: tier.map(|t| t.parse()).transpose()?,
            last_error: row.get("last_error"),
            used: row.get("used"),
            created_at: row.get("created_at"),
            evaluated_at: row.get("evaluated_at"),
        })
    }
}

#[async_trait]
impl CandidateRepository for PgCandidateRepository {
    async fn commit_batch(
        &self,
        pairs: &[NewCandidatePair],
        advance: Option<ProgressAdvance>,
    ) -> Result<u64> {
        if let Some(bad) = pairs.iter().find(|p| p.claim_a >= p.claim_b) {
            return Err(Error::InvalidInput(format!(
                "pair ({}, {}) is not canonical",
                bad.claim_a, bad.claim_b
            )));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted = if pairs.is_empty() {
            0
        } else {
            let mut ids = Vec::with_capacity(pairs.len());
            let mut claim_a = Vec::with_capacity(pairs.len());
            let mut claim_b = Vec::with_capacity(pairs.len());
            let mut similarity = Vec::with_capacity(pairs.len());
            let mut document_a = Vec::with_capacity(pairs.len());
            let mut document_b = Vec::with_capacity(pairs.len());
            let mut run_ids = Vec::with_capacity(pairs.len());
            for p in pairs {
                ids.push(new_v7());
                claim_a.push(p.claim_a);
                claim_b.push(p.claim_b);
                similarity.push(p.similarity);
                document_a.push(p.document_a);
                document_b.push(p.document_b);
                run_ids.push(p.run_id);
            }

            sqlx::query(
                "INSERT INTO candidate_pair
                     (id, claim_a, claim_b, similarity, document_a, document_b, run_id)
                 SELECT * FROM UNNEST($1::uuid[], $2::bigint[], $3::bigint[], $4::real[],
                                      $5::uuid[], $6::uuid[], $7::uuid[])
                 ON CONFLICT (claim_a, claim_b) DO NOTHING",
            )
            .bind(&ids)
            .bind(&claim_a)
            .bind(&claim_b)
            .bind(&similarity)
            .bind(&document_a)
            .bind(&document_b)
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected()
        };

        if let Some(mut advance) = advance {
            advance.pairs_inserted = inserted as i64;
            advance_in_tx(&mut tx, advance).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "candidates",
            op = "commit_batch",
            offered = pairs.len(),
            pairs_inserted = inserted,
            "Candidate batch committed"
        );
        Ok(inserted)
    }

    async fn get_candidate(&self, id: Uuid) -> Result<Option<CandidatePair>> {
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidate_pair WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_row).transpose()
    }

    async fn candidate_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM candidate_pair")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn scored_unused(&self, tier: QualityTier, limit: i64) -> Result<Vec<CandidatePair>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS}
             FROM candidate_pair
             WHERE status = 'completed' AND used = FALSE AND quality_tier = $1
             ORDER BY score DESC, id
             LIMIT $2"
        ))
        .bind(tier.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn mark_used(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE candidate_pair SET used = TRUE, used_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("candidate pair {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl EvaluationQueue for PgCandidateRepository {
    async fn claim_for_evaluation(&self, limit: i64) -> Result<Vec<CandidatePair>> {
        // SKIP LOCKED lets several evaluator workers drain the queue without
        // handing out the same pair twice.
        let rows = sqlx::query(&format!(
            "UPDATE candidate_pair
             SET status = 'processing', claimed_at = NOW()
             WHERE id IN (
                 SELECT id FROM candidate_pair
                 WHERE status = 'pending'
                 ORDER BY created_at, id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {CANDIDATE_COLUMNS}"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut claimed = rows
            .into_iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by(|x, y| x.created_at.cmp(&y.created_at).then(x.id.cmp(&y.id)));
        Ok(claimed)
    }

    async fn complete_evaluation(&self, id: Uuid, score: f64) -> Result<Option<QualityTier>> {
        if !(0.0..=SCORE_MAX).contains(&score) {
            return Err(Error::InvalidInput(format!(
                "score {score} outside [0, {SCORE_MAX}]"
            )));
        }
        let tier = QualityTier::from_score(score);

        let result = sqlx::query(
            "UPDATE candidate_pair
             SET status = 'completed', score = $2, quality_tier = $3,
                 last_error = NULL, evaluated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(score)
        .bind(tier.map(|t| t.as_str()))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return match self.get_candidate(id).await? {
                Some(pair) => Err(Error::InvalidState(format!(
                    "pair {id} is {}, not processing",
                    pair.status
                ))),
                None => Err(Error::NotFound(format!("candidate pair {id}"))),
            };
        }
        Ok(tier)
    }

    async fn fail_evaluation(
        &self,
        id: Uuid,
        reason: &str,
        max_attempts: i32,
    ) -> Result<EvaluationStatus> {
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE candidate_pair
             SET attempts = attempts + 1,
                 last_error = $2,
                 claimed_at = NULL,
                 status = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE 'pending' END
             WHERE id = $1 AND status = 'processing'
             RETURNING status",
        )
        .bind(id)
        .bind(reason)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match status {
            Some(s) => {
                let status: EvaluationStatus = s.parse()?;
                if status == EvaluationStatus::Failed {
                    warn!(
                        subsystem = "db",
                        component = "evaluation",
                        op = "fail_evaluation",
                        pair_id = %id,
                        error = reason,
                        "Candidate pair exhausted its evaluation attempts"
                    );
                }
                Ok(status)
            }
            None => match self.get_candidate(id).await? {
                Some(pair) => Err(Error::InvalidState(format!(
                    "pair {id} is {}, not processing",
                    pair.status
                ))),
                None => Err(Error::NotFound(format!("candidate pair {id}"))),
            },
        }
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE candidate_pair
             SET status = 'pending', claimed_at = NULL
             WHERE status = 'processing' AND claimed_at < $1",
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn pending_evaluation_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM candidate_pair WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}
