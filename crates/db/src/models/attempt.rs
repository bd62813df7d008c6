//! Models for the `work_attempts` table.

use rigger_core::status::{AttemptStatus, StatusId};
use rigger_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One provisioning session for a (user, task) pair on a host.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkAttempt {
    pub id: DbId,
    pub user_id: DbId,
    pub task_id: DbId,
    pub host_id: DbId,
    pub status_id: StatusId,
    /// Joined from `attempt_statuses.name`.
    pub status_name: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub container_port: Option<i32>,
    pub metadata: serde_json::Value,
    pub metadata_version: i64,
    pub notes: Option<String>,
    pub claimed_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkAttempt {
    pub fn status(&self) -> Option<AttemptStatus> {
        AttemptStatus::from_id(self.status_id)
    }
}

/// DTO for creating a pending attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkAttempt {
    pub user_id: DbId,
    pub task_id: DbId,
    pub host_id: DbId,
}

/// Container identity recorded once the workspace is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub container_id: String,
    pub container_name: String,
    pub container_port: Option<i32>,
}
