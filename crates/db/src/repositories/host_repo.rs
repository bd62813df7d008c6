//! Repository for the `hosts` table.

use rigger_core::metadata::WORKFLOW_KEYS;
use rigger_core::status::HostStatus;
use rigger_core::types::DbId;
use sqlx::PgPool;

use crate::models::host::{CreateHost, Host, DEFAULT_SSH_PORT};

/// Column list for `hosts` queries, including the joined status name.
const COLUMNS: &str = "\
    h.id, h.name, h.address, h.ssh_port, h.username, h.password, h.identity_file, \
    h.status_id, s.name AS status_name, \
    h.metadata, h.metadata_version, h.notes, h.claimed_at, \
    h.created_at, h.updated_at";

/// Join clause used in all read queries.
const JOIN: &str = "hosts h JOIN host_statuses s ON h.status_id = s.id";

pub struct HostRepo;

impl HostRepo {
    /// Register a host in `pending` status.
    pub async fn create(pool: &PgPool, input: &CreateHost) -> Result<Host, sqlx::Error> {
        let id: DbId = sqlx::query_scalar(
            "INSERT INTO hosts (name, address, ssh_port, username, password, identity_file, status_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id",
        )
        .bind(&input.name)
        .bind(&input.address)
        .bind(input.ssh_port.unwrap_or(DEFAULT_SSH_PORT))
        .bind(input.username.as_deref().unwrap_or("root"))
        .bind(&input.password)
        .bind(&input.identity_file)
        .bind(HostStatus::Pending.id())
        .fetch_one(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Host>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM {JOIN} WHERE h.id = $1");
        sqlx::query_as::<_, Host>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim the oldest unclaimed pending host not in `skip`.
    pub async fn claim_next_pending(
        pool: &PgPool,
        skip: &[DbId],
    ) -> Result<Option<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE hosts SET claimed_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM hosts \
                 WHERE status_id = $1 AND claimed_at IS NULL AND id <> ALL($2) \
                 ORDER BY created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id",
        )
        .bind(HostStatus::Pending.id())
        .bind(skip)
        .fetch_optional(pool)
        .await
    }

    pub async fn set_status(
        pool: &PgPool,
        id: DbId,
        status: HostStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE hosts SET status_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.id())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Put a failed host back in the queue with a clean workflow.
    ///
    /// Returns `false` when the host is not in `failed` status.
    pub async fn request_reprovision(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE hosts SET \
                status_id = $2, \
                claimed_at = NULL, \
                metadata = metadata - $4::text[], \
                metadata_version = metadata_version + 1, \
                updated_at = NOW() \
             WHERE id = $1 AND status_id = $3",
        )
        .bind(id)
        .bind(HostStatus::Pending.id())
        .bind(HostStatus::Failed.id())
        .bind(&WORKFLOW_KEYS[..])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
