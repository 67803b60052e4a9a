//! Claim embedding corpus repository.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

use serendip_core::{ClaimCorpus, ClaimEmbedding, ClaimId, Error, NewClaim, Result};

/// PostgreSQL implementation of ClaimCorpus.
#[derive(Clone)]
pub struct PgClaimCorpus {
    pool: Pool<Postgres>,
}

impl PgClaimCorpus {
    /// Create a new PgClaimCorpus with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> ClaimEmbedding {
        ClaimEmbedding {
            id: row.get("id"),
            document_id: row.get("document_id"),
            vector: row.get("vector"),
            sample_key: row.get("sample_key"),
        }
    }
}

#[async_trait]
impl ClaimCorpus for PgClaimCorpus {
    async fn insert_claim(&self, claim: NewClaim) -> Result<ClaimId> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("INSERT INTO source_document (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(claim.document_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        // sample_key takes the column default (random()).
        let id: ClaimId = sqlx::query_scalar(
            "INSERT INTO claim_embedding (document_id, claim_text, vector)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(claim.document_id)
        .bind(&claim.text)
        .bind(&claim.vector)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(id)
    }

    async fn claim_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM claim_embedding")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn max_claim_id(&self) -> Result<Option<ClaimId>> {
        sqlx::query_scalar("SELECT MAX(id) FROM claim_embedding")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn next_sources(&self, after: ClaimId, limit: i64) -> Result<Vec<ClaimEmbedding>> {
        // Keyset pagination on the primary key; cost is independent of position.
        let rows = sqlx::query(
            "SELECT id, document_id, vector, sample_key
             FROM claim_embedding
             WHERE id > $1
             ORDER BY id
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn sample_range(&self, start: f64, limit: i64) -> Result<Vec<ClaimEmbedding>> {
        // Both arms are index range scans on (sample_key, id); the second arm
        // only contributes when the first runs off the end of [0, 1).
        let rows = sqlx::query(
            "SELECT id, document_id, vector, sample_key FROM (
                 (SELECT id, document_id, vector, sample_key, 0 AS wrapped
                  FROM claim_embedding
                  WHERE sample_key >= $1
                  ORDER BY sample_key, id
                  LIMIT $2)
                 UNION ALL
                 (SELECT id, document_id, vector, sample_key, 1 AS wrapped
                  FROM claim_embedding
                  WHERE sample_key < $1
                  ORDER BY sample_key, id
                  LIMIT $2)
             ) s
             ORDER BY wrapped, sample_key, id
             LIMIT $2",
        )
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }
}
