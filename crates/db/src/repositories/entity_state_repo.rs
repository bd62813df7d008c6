//! Metadata bag, notes and claim columns shared by `hosts` and
//! `work_attempts`.

use rigger_core::entity::{EntityKind, EntityRef};
use rigger_core::types::DbId;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

/// Tables that carry a metadata bag and a notes log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTable {
    Hosts,
    WorkAttempts,
}

impl StateTable {
    /// `None` for entity kinds without a bag or notes.
    pub fn for_kind(kind: EntityKind) -> Option<Self> {
        match kind {
            EntityKind::Host => Some(Self::Hosts),
            EntityKind::WorkAttempt => Some(Self::WorkAttempts),
            EntityKind::ExecutionRecord => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hosts => "hosts",
            Self::WorkAttempts => "work_attempts",
        }
    }
}

/// Row-level access to the state columns.
pub struct EntityStateRepo;

impl EntityStateRepo {
    /// Read the bag and its version.
    pub async fn load_metadata(
        pool: &PgPool,
        table: StateTable,
        id: DbId,
    ) -> Result<Option<(Value, i64)>, sqlx::Error> {
        let query = format!(
            "SELECT metadata, metadata_version FROM {} WHERE id = $1",
            table.name()
        );
        sqlx::query_as::<_, (Value, i64)>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Read the bag and lock the row until the surrounding transaction ends.
    pub async fn lock_metadata(
        conn: &mut PgConnection,
        table: StateTable,
        id: DbId,
    ) -> Result<Option<(Value, i64)>, sqlx::Error> {
        let query = format!(
            "SELECT metadata, metadata_version FROM {} WHERE id = $1 FOR UPDATE",
            table.name()
        );
        sqlx::query_as::<_, (Value, i64)>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    /// Replace the bag and its version.
    pub async fn store_metadata(
        conn: &mut PgConnection,
        table: StateTable,
        id: DbId,
        metadata: &Value,
        version: i64,
    ) -> Result<(), sqlx::Error> {
        let query = format!(
            "UPDATE {} SET metadata = $2, metadata_version = $3, updated_at = NOW() WHERE id = $1",
            table.name()
        );
        sqlx::query(&query)
            .bind(id)
            .bind(metadata)
            .bind(version)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Append one line to the notes log in a single statement.
    pub async fn append_note(
        pool: &PgPool,
        table: StateTable,
        id: DbId,
        line: &str,
    ) -> Result<bool, sqlx::Error> {
        let query = format!(
            "UPDATE {} SET \
                notes = CASE WHEN notes IS NULL OR notes = '' THEN $2 \
                             ELSE notes || E'\\n' || $2 END, \
                updated_at = NOW() \
             WHERE id = $1",
            table.name()
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(line)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Clear `claimed_at` so the dispatcher can pick the row up again.
    pub async fn release_claim(
        pool: &PgPool,
        table: StateTable,
        id: DbId,
    ) -> Result<(), sqlx::Error> {
        let query = format!(
            "UPDATE {} SET claimed_at = NULL, updated_at = NOW() WHERE id = $1",
            table.name()
        );
        sqlx::query(&query).bind(id).execute(pool).await?;
        Ok(())
    }

    /// Status name of any tracked entity.
    pub async fn status_name(
        pool: &PgPool,
        entity: EntityRef,
    ) -> Result<Option<String>, sqlx::Error> {
        let query = match entity.kind {
            EntityKind::Host => {
                "SELECT s.name FROM hosts h JOIN host_statuses s ON h.status_id = s.id \
                 WHERE h.id = $1"
            }
            EntityKind::WorkAttempt => {
                "SELECT s.name FROM work_attempts a JOIN attempt_statuses s ON a.status_id = s.id \
                 WHERE a.id = $1"
            }
            EntityKind::ExecutionRecord => {
                "SELECT s.name FROM execution_records e JOIN execution_statuses s ON e.status_id = s.id \
                 WHERE e.id = $1"
            }
        };
        sqlx::query_scalar::<_, String>(query)
            .bind(entity.id)
            .fetch_optional(pool)
            .await
    }
}
