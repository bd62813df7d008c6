//! Repository for the `execution_records` table.
//!
//! [`finalize`](ExecutionRecordRepo::finalize) is the only terminal
//! mutation: one `UPDATE` guarded by `status = running`, so a record is
//! finalised at most once and never observed half-terminal.

use rigger_core::status::ExecutionStatus;
use rigger_core::types::DbId;
use sqlx::PgPool;

use crate::models::execution::{ExecutionOutcome, ExecutionRecord, NewExecutionRecord};

/// Column list for `execution_records` queries, including the joined status name.
const COLUMNS: &str = "\
    e.id, e.status_id, s.name AS status_name, \
    e.template, e.name, e.script, \
    e.output, e.error_output, e.exit_code, e.metadata, \
    e.user_id, e.host_id, e.task_id, e.attempt_id, \
    e.started_at, e.completed_at, e.failed_at, \
    e.terminated_at, e.cancelled_at, e.timed_out_at, \
    e.created_at, e.updated_at";

/// Join clause used in all read queries.
const JOIN: &str = "execution_records e JOIN execution_statuses s ON e.status_id = s.id";

/// Maximum page size for listings.
const MAX_LIMIT: i64 = 100;

pub struct ExecutionRecordRepo;

impl ExecutionRecordRepo {
    /// Insert a `running` record with `started_at = now()`.
    pub async fn create(pool: &PgPool, input: &NewExecutionRecord) -> Result<DbId, sqlx::Error> {
        Self::insert(pool, input, ExecutionStatus::Running).await
    }

    /// Insert a `pending` record for the worker to pick up.
    pub async fn enqueue(pool: &PgPool, input: &NewExecutionRecord) -> Result<DbId, sqlx::Error> {
        Self::insert(pool, input, ExecutionStatus::Pending).await
    }

    async fn insert(
        pool: &PgPool,
        input: &NewExecutionRecord,
        status: ExecutionStatus,
    ) -> Result<DbId, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO execution_records \
                (status_id, template, name, script, metadata, user_id, host_id, task_id, attempt_id, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, CASE WHEN $10 THEN NOW() END) \
             RETURNING id",
        )
        .bind(status.id())
        .bind(&input.template)
        .bind(&input.name)
        .bind(&input.script)
        .bind(&input.metadata)
        .bind(input.user_id)
        .bind(input.host_id)
        .bind(input.task_id)
        .bind(input.attempt_id)
        .bind(status == ExecutionStatus::Running)
        .fetch_one(pool)
        .await
    }

    /// Atomically move the oldest pending record to `running`, passing over
    /// records that target a host in `skip_hosts`.
    pub async fn claim_next_queued(
        pool: &PgPool,
        skip_hosts: &[DbId],
    ) -> Result<Option<ExecutionRecord>, sqlx::Error> {
        let claimed: Option<DbId> = sqlx::query_scalar(
            "UPDATE execution_records SET status_id = $1, started_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM execution_records \
                 WHERE status_id = $2 \
                   AND (host_id IS NULL OR host_id <> ALL($3)) \
                 ORDER BY created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id",
        )
        .bind(ExecutionStatus::Running.id())
        .bind(ExecutionStatus::Pending.id())
        .bind(skip_hosts)
        .fetch_optional(pool)
        .await?;

        match claimed {
            Some(id) => Self::find_by_id(pool, id).await,
            None => Ok(None),
        }
    }

    /// Undo [`claim_next_queued`](Self::claim_next_queued) for a record that
    /// could not be started.
    pub async fn release_claim(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE execution_records SET status_id = $2, started_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(ExecutionStatus::Pending.id())
        .bind(ExecutionStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Write the terminal status, outputs and timestamps in one update.
    ///
    /// Returns `false` if the record was not `running` (already final or
    /// unknown).
    pub async fn finalize(
        pool: &PgPool,
        id: DbId,
        outcome: &ExecutionOutcome,
    ) -> Result<bool, sqlx::Error> {
        let cols = outcome.columns();
        let result = sqlx::query(
            "UPDATE execution_records SET \
                status_id = $2, \
                output = $3, \
                error_output = $4, \
                exit_code = $5, \
                completed_at = CASE WHEN $6 THEN NOW() END, \
                failed_at = CASE WHEN $7 THEN NOW() END, \
                timed_out_at = CASE WHEN $8 THEN NOW() END, \
                updated_at = NOW() \
             WHERE id = $1 AND status_id = $9",
        )
        .bind(id)
        .bind(cols.status.id())
        .bind(&cols.output)
        .bind(&cols.error_output)
        .bind(cols.exit_code)
        .bind(cols.completed)
        .bind(cols.failed)
        .bind(cols.timed_out)
        .bind(ExecutionStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<ExecutionRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM {JOIN} WHERE e.id = $1");
        sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Most recent first.
    pub async fn list_for_host(
        pool: &PgPool,
        host_id: DbId,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM {JOIN} WHERE e.host_id = $1 ORDER BY e.id DESC LIMIT $2"
        );
        sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(host_id)
            .bind(limit.clamp(1, MAX_LIMIT))
            .fetch_all(pool)
            .await
    }

    /// Most recent first.
    pub async fn list_for_attempt(
        pool: &PgPool,
        attempt_id: DbId,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM {JOIN} WHERE e.attempt_id = $1 ORDER BY e.id DESC LIMIT $2"
        );
        sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(attempt_id)
            .bind(limit.clamp(1, MAX_LIMIT))
            .fetch_all(pool)
            .await
    }
}
