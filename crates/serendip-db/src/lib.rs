//! # serendip-db
//!
//! PostgreSQL + pgvector storage for serendip.
//!
//! This crate provides:
//! - Connection pool management
//! - The claim embedding corpus with `sample_key` range sampling
//! - Similarity observations and the cached distribution snapshot
//! - Candidate pairs and the evaluation queue
//! - Mining run progress with the single-active-run constraint
//!
//! ## Example
//!
//! ```rust,ignore
//! use serendip_db::{ClaimCorpus, Database};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/serendip").await?;
//!     println!("{} claims", db.corpus.claim_count().await?);
//!     Ok(())
//! }
//! ```

pub mod candidates;
pub mod corpus;
pub mod observations;
pub mod pool;
pub mod progress;

// Test fixtures for integration tests
// Always compiled so integration tests (in tests/) can share them
pub mod test_fixtures;

// Re-export core types
pub use serendip_core::*;

pub use candidates::PgCandidateRepository;
pub use corpus::PgClaimCorpus;
pub use observations::PgObservationRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use progress::PgProgressRepository;

/// All serendip repositories over one connection pool.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Claim embeddings and range sampling.
    pub corpus: PgClaimCorpus,
    /// Similarity observations and the distribution snapshot.
    pub observations: PgObservationRepository,
    /// Candidate pairs and the evaluation queue.
    pub candidates: PgCandidateRepository,
    /// Mining run progress.
    pub progress: PgProgressRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            corpus: PgClaimCorpus::new(pool.clone()),
            observations: PgObservationRepository::new(pool.clone()),
            candidates: PgCandidateRepository::new(pool.clone()),
            progress: PgProgressRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
