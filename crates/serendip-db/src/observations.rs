//! Similarity observation and distribution snapshot repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use serendip_core::{
    v7_from_timestamp, DistributionRepository, DistributionSnapshot, Error, ObservationRepository,
    Result, SimilarityObservation,
};

/// PostgreSQL implementation of ObservationRepository and DistributionRepository.
#[derive(Clone)]
pub struct PgObservationRepository {
    pool: Pool<Postgres>,
}

impl PgObservationRepository {
    /// Create a new PgObservationRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObservationRepository for PgObservationRepository {
    async fn insert_observations(&self, observations: &[SimilarityObservation]) -> Result<u64> {
        if observations.is_empty() {
            return Ok(0);
        }

        let mut run_ids = Vec::with_capacity(observations.len());
        let mut similarities = Vec::with_capacity(observations.len());
        let mut sources = Vec::with_capacity(observations.len());
        let mut dests = Vec::with_capacity(observations.len());
        let mut seeds = Vec::with_capacity(observations.len());
        let mut policies = Vec::with_capacity(observations.len());
        for o in observations {
            run_ids.push(o.run_id);
            similarities.push(o.similarity);
            sources.push(o.source_claim_id);
            dests.push(o.dest_claim_id);
            seeds.push(o.seed);
            policies.push(o.sampling_policy.clone());
        }

        // A single statement is atomic: the round lands whole or not at all.
        let result = sqlx::query(
            "INSERT INTO similarity_observation
                 (run_id, similarity, source_claim_id, dest_claim_id, seed, sampling_policy)
             SELECT * FROM UNNEST($1::uuid[], $2::real[], $3::bigint[], $4::bigint[],
                                  $5::bigint[], $6::text[])",
        )
        .bind(&run_ids)
        .bind(&similarities)
        .bind(&sources)
        .bind(&dests)
        .bind(&seeds)
        .bind(&policies)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn latest_observation_run(&self) -> Result<Option<Uuid>> {
        // Run ids are UUIDv7, so the maximum is the most recent run.
        sqlx::query_scalar(
            "SELECT run_id FROM similarity_observation ORDER BY run_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn observation_values(&self, run_id: Uuid, cap: i64) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            "SELECT similarity::float8 AS similarity
             FROM similarity_observation
             WHERE run_id = $1
             ORDER BY id
             LIMIT $2",
        )
        .bind(run_id)
        .bind(cap)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|r| r.get("similarity")).collect())
    }

    async fn observation_count(&self, run_id: Uuid) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM similarity_observation WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn purge_observations(
        &self,
        cutoff: DateTime<Utc>,
        keep_run: Option<Uuid>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM similarity_observation
             WHERE run_id < $1
               AND ($2::uuid IS NULL OR run_id <> $2)",
        )
        .bind(v7_from_timestamp(&cutoff))
        .bind(keep_run)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DistributionRepository for PgObservationRepository {
    async fn upsert_snapshot(&self, snapshot: &DistributionSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO distribution_snapshot
                 (id, run_id, corpus_size, observation_count, percentiles, mean, stddev,
                  is_approximate, compute_ms, computed_at)
             VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE SET
                 run_id = EXCLUDED.run_id,
                 corpus_size = EXCLUDED.corpus_size,
                 observation_count = EXCLUDED.observation_count,
                 percentiles = EXCLUDED.percentiles,
                 mean = EXCLUDED.mean,
                 stddev = EXCLUDED.stddev,
                 is_approximate = EXCLUDED.is_approximate,
                 compute_ms = EXCLUDED.compute_ms,
                 computed_at = EXCLUDED.computed_at",
        )
        .bind(snapshot.run_id)
        .bind(snapshot.corpus_size)
        .bind(snapshot.observation_count)
        .bind(&snapshot.percentiles)
        .bind(snapshot.mean)
        .bind(snapshot.stddev)
        .bind(snapshot.is_approximate)
        .bind(snapshot.compute_ms)
        .bind(snapshot.computed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn current_snapshot(&self) -> Result<Option<DistributionSnapshot>> {
        let row = sqlx::query(
            "SELECT run_id, corpus_size, observation_count, percentiles, mean, stddev,
                    is_approximate, compute_ms, computed_at
             FROM distribution_snapshot
             WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| DistributionSnapshot {
            run_id: row.get("run_id"),
            corpus_size: row.get("corpus_size"),
            observation_count: row.get("observation_count"),
            percentiles: row.get("percentiles"),
            mean: row.get("mean"),
            stddev: row.get("stddev"),
            is_approximate: row.get("is_approximate"),
            compute_ms: row.get("compute_ms"),
            computed_at: row.get("computed_at"),
        }))
    }
}
