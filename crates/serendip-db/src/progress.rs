//! Mining progress repository.
//!
//! The single-active-run rule is the partial unique index
//! `uq_mining_progress_single_active`; a second activation fails with a
//! unique violation, which is mapped to `Error::ConcurrentRun`.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgConnection, Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use serendip_core::{
    new_v7, Error, MiningParams, MiningProgress, ProgressAdvance, ProgressRepository, Result,
    RunStatus,
};

const PROGRESS_COLUMNS: &str = "id, status, last_source_id, sources_processed, pairs_inserted, \
     batches, params, resumed_from, last_error, consecutive_failures, started_at, updated_at, \
     finished_at";

const SINGLE_ACTIVE_INDEX: &str = "uq_mining_progress_single_active";

/// PostgreSQL implementation of ProgressRepository.
#[derive(Clone)]
pub struct PgProgressRepository {
    pool: Pool<Postgres>,
}

impl PgProgressRepository {
    /// Create a new PgProgressRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: PgRow) -> Result<MiningProgress> {
        let status: String = row.get("status");
        let params: serde_json::Value = row.get("params");
        Ok(MiningProgress {
            id: row.get("id"),
            status: status.parse()?,
            last_source_id: row.get("last_source_id"),
            sources_processed: row.get("sources_processed"),
            pairs_inserted: row.get("pairs_inserted"),
            batches: row.get("batches"),
            params: serde_json::from_value(params)?,
            resumed_from: row.get("resumed_from"),
            last_error: row.get("last_error"),
            consecutive_failures: row.get("consecutive_failures"),
            started_at: row.get("started_at"),
            updated_at: row.get("updated_at"),
            finished_at: row.get("finished_at"),
        })
    }

    async fn fetch_run(conn: &mut PgConnection, id: Uuid) -> Result<Option<MiningProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM mining_progress WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_row).transpose()
    }

    async fn active_run_id(conn: &mut PgConnection) -> Result<Option<Uuid>> {
        sqlx::query_scalar("SELECT id FROM mining_progress WHERE status = 'in_progress'")
            .fetch_optional(conn)
            .await
            .map_err(Error::Database)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<MiningProgress> {
        let row = sqlx::query(&format!(
            "UPDATE mining_progress
             SET status = $2, finished_at = NOW(), updated_at = NOW(),
                 last_error = COALESCE($3, last_error)
             WHERE id = $1 AND status = 'in_progress'
             RETURNING {PROGRESS_COLUMNS}"
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => {
                let run = Self::parse_row(row)?;
                info!(
                    subsystem = "db",
                    component = "progress",
                    op = "transition",
                    run_id = %id,
                    status = %to,
                    "Mining run transitioned"
                );
                Ok(run)
            }
            None => {
                let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
                match Self::fetch_run(&mut conn, id).await? {
                    Some(run) => Err(Error::InvalidState(format!(
                        "cannot move run {id} from {} to {to}",
                        run.status
                    ))),
                    None => Err(Error::RunNotFound(id)),
                }
            }
        }
    }
}

/// Apply a cursor advance inside an open transaction.
///
/// The cursor never moves backwards, and only an `in_progress` run accepts it.
pub(crate) async fn advance_in_tx(
    conn: &mut PgConnection,
    advance: ProgressAdvance,
) -> Result<MiningProgress> {
    let row = sqlx::query(&format!(
        "UPDATE mining_progress
         SET last_source_id = GREATEST(last_source_id, $2),
             sources_processed = sources_processed + $3,
             pairs_inserted = pairs_inserted + $4,
             batches = batches + 1,
             consecutive_failures = 0,
             last_error = NULL,
             updated_at = NOW()
         WHERE id = $1 AND status = 'in_progress'
         RETURNING {PROGRESS_COLUMNS}"
    ))
    .bind(advance.run_id)
    .bind(advance.cursor)
    .bind(advance.sources_processed)
    .bind(advance.pairs_inserted)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;

    match row {
        Some(row) => PgProgressRepository::parse_row(row),
        None => match PgProgressRepository::fetch_run(conn, advance.run_id).await? {
            Some(run) => Err(Error::InvalidState(format!(
                "run {} is {}, not in_progress",
                run.id, run.status
            ))),
            None => Err(Error::RunNotFound(advance.run_id)),
        },
    }
}

fn is_single_active_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.constraint() == Some(SINGLE_ACTIVE_INDEX)
        }
        _ => false,
    }
}

#[async_trait]
impl ProgressRepository for PgProgressRepository {
    async fn start_run(
        &self,
        params: &MiningParams,
        resume_from: Option<Uuid>,
    ) -> Result<MiningProgress> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (mut cursor, mut sources, mut pairs, mut batches, mut params) =
            (0i64, 0i64, 0i64, 0i64, params.clone());
        if let Some(prev_id) = resume_from {
            let prev = Self::fetch_run(&mut tx, prev_id)
                .await?
                .ok_or(Error::RunNotFound(prev_id))?;
            if !matches!(prev.status, RunStatus::Paused | RunStatus::Failed) {
                return Err(Error::InvalidState(format!(
                    "run {prev_id} is {}, only paused or failed runs can be resumed",
                    prev.status
                )));
            }
            cursor = prev.last_source_id;
            sources = prev.sources_processed;
            pairs = prev.pairs_inserted;
            batches = prev.batches;
            params = prev.params;
        }

        let id = new_v7();
        sqlx::query(
            "INSERT INTO mining_progress
                 (id, status, last_source_id, sources_processed, pairs_inserted, batches,
                  params, resumed_from)
             VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(cursor)
        .bind(sources)
        .bind(pairs)
        .bind(batches)
        .bind(serde_json::to_value(&params)?)
        .bind(resume_from)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        // pending -> in_progress; the partial unique index arbitrates.
        let activated = sqlx::query(&format!(
            "UPDATE mining_progress SET status = 'in_progress', updated_at = NOW()
             WHERE id = $1
             RETURNING {PROGRESS_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await;

        let row = match activated {
            Ok(row) => row,
            Err(e) if is_single_active_violation(&e) => {
                drop(tx);
                let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
                let active = Self::active_run_id(&mut conn).await?.unwrap_or(Uuid::nil());
                return Err(Error::ConcurrentRun(active));
            }
            Err(e) => return Err(Error::Database(e)),
        };
        let run = Self::parse_row(row)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "progress",
            op = "start_run",
            run_id = %run.id,
            cursor = run.last_source_id,
            resumed_from = ?resume_from,
            "Mining run started"
        );
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<MiningProgress>> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        Self::fetch_run(&mut conn, id).await
    }

    async fn active_run(&self) -> Result<Option<MiningProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM mining_progress WHERE status = 'in_progress'"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_row).transpose()
    }

    async fn latest_run(&self) -> Result<Option<MiningProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM mining_progress ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_row).transpose()
    }

    async fn advance(&self, advance: ProgressAdvance) -> Result<MiningProgress> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let run = advance_in_tx(&mut tx, advance).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(run)
    }

    async fn record_failure(&self, id: Uuid, reason: &str) -> Result<MiningProgress> {
        let row = sqlx::query(&format!(
            "UPDATE mining_progress
             SET consecutive_failures = consecutive_failures + 1,
                 last_error = $2,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {PROGRESS_COLUMNS}"
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_row)
            .transpose()?
            .ok_or(Error::RunNotFound(id))
    }

    async fn pause(&self, id: Uuid) -> Result<MiningProgress> {
        self.transition(id, RunStatus::Paused, None).await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<MiningProgress> {
        self.transition(id, RunStatus::Failed, Some(reason)).await
    }

    async fn complete(&self, id: Uuid) -> Result<MiningProgress> {
        self.transition(id, RunStatus::Completed, None).await
    }
}
