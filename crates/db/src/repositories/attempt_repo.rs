//! Repository for the `work_attempts` table.

use rigger_core::metadata::WORKFLOW_KEYS;
use rigger_core::status::{AttemptStatus, HostStatus};
use rigger_core::types::DbId;
use sqlx::PgPool;

use crate::models::attempt::{ContainerIdentity, CreateWorkAttempt, WorkAttempt};

/// Column list for `work_attempts` queries, including the joined status name.
const COLUMNS: &str = "\
    a.id, a.user_id, a.task_id, a.host_id, \
    a.status_id, s.name AS status_name, \
    a.container_id, a.container_name, a.container_port, \
    a.metadata, a.metadata_version, a.notes, a.claimed_at, \
    a.started_at, a.completed_at, a.failed_at, \
    a.created_at, a.updated_at";

/// Join clause used in all read queries.
const JOIN: &str = "work_attempts a JOIN attempt_statuses s ON a.status_id = s.id";

pub struct WorkAttemptRepo;

impl WorkAttemptRepo {
    pub async fn create(
        pool: &PgPool,
        input: &CreateWorkAttempt,
    ) -> Result<WorkAttempt, sqlx::Error> {
        let id: DbId = sqlx::query_scalar(
            "INSERT INTO work_attempts (user_id, task_id, host_id, status_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id",
        )
        .bind(input.user_id)
        .bind(input.task_id)
        .bind(input.host_id)
        .bind(AttemptStatus::Pending.id())
        .fetch_one(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<WorkAttempt>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM {JOIN} WHERE a.id = $1");
        sqlx::query_as::<_, WorkAttempt>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_host(
        pool: &PgPool,
        host_id: DbId,
    ) -> Result<Vec<WorkAttempt>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM {JOIN} WHERE a.host_id = $1 ORDER BY a.id DESC");
        sqlx::query_as::<_, WorkAttempt>(&query)
            .bind(host_id)
            .fetch_all(pool)
            .await
    }

    /// Atomically claim the oldest unclaimed pending attempt whose host is
    /// already provisioned. Attempts in `skip` are passed over.
    pub async fn claim_next_pending(
        pool: &PgPool,
        skip: &[DbId],
    ) -> Result<Option<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE work_attempts SET claimed_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT a.id FROM work_attempts a \
                 JOIN hosts h ON a.host_id = h.id \
                 WHERE a.status_id = $1 AND a.claimed_at IS NULL AND h.status_id = $2 \
                   AND a.id <> ALL($3) \
                 ORDER BY a.created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE OF a SKIP LOCKED \
             ) \
             RETURNING id",
        )
        .bind(AttemptStatus::Pending.id())
        .bind(HostStatus::Provisioned.id())
        .bind(skip)
        .fetch_optional(pool)
        .await
    }

    /// Set the status, stamping `started_at` on `running` and `failed_at` /
    /// `completed_at` on the terminal statuses.
    pub async fn set_status(
        pool: &PgPool,
        id: DbId,
        status: AttemptStatus,
    ) -> Result<bool, sqlx::Error> {
        let stamp = match status {
            AttemptStatus::Running => ", started_at = COALESCE(started_at, NOW())",
            AttemptStatus::Completed => ", completed_at = NOW()",
            AttemptStatus::Failed => ", failed_at = NOW()",
            AttemptStatus::Pending => "",
        };
        let query =
            format!("UPDATE work_attempts SET status_id = $2{stamp}, updated_at = NOW() WHERE id = $1");
        let result = sqlx::query(&query)
            .bind(id)
            .bind(status.id())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_container(
        pool: &PgPool,
        id: DbId,
        container: &ContainerIdentity,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE work_attempts SET \
                container_id = $2, container_name = $3, container_port = $4, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&container.container_id)
        .bind(&container.container_name)
        .bind(container.container_port)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Put a failed attempt back in the queue with a clean workflow.
    ///
    /// Returns `false` when the attempt is not in `failed` status.
    pub async fn request_retry(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE work_attempts SET \
                status_id = $2, \
                claimed_at = NULL, \
                failed_at = NULL, \
                metadata = metadata - $4::text[], \
                metadata_version = metadata_version + 1, \
                updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(AttemptStatus::Pending.id())
        .bind(AttemptStatus::Failed.id())
        .bind(&WORKFLOW_KEYS[..])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
