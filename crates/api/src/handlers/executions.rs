//! Handlers for the `/executions` resource.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use rigger_core::error::CoreError;
use rigger_core::types::{DbId, Timestamp};
use rigger_db::models::execution::ExecutionRecord;
use rigger_db::repositories::ExecutionRecordRepo;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// What pollers see of an execution record. The rendered script is left
/// out.
#[derive(Debug, Serialize)]
pub struct ExecutionView {
    pub id: DbId,
    pub status: String,
    pub template: String,
    pub name: String,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    pub metadata: serde_json::Value,
    pub host_id: Option<DbId>,
    pub attempt_id: Option<DbId>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub timed_out_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl From<ExecutionRecord> for ExecutionView {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            id: record.id,
            status: record.status_name,
            template: record.template,
            name: record.name,
            output: record.output,
            error_output: record.error_output,
            exit_code: record.exit_code,
            metadata: record.metadata,
            host_id: record.host_id,
            attempt_id: record.attempt_id,
            started_at: record.started_at,
            completed_at: record.completed_at,
            failed_at: record.failed_at,
            timed_out_at: record.timed_out_at,
            created_at: record.created_at,
        }
    }
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let record = ExecutionRecordRepo::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Execution",
            id,
        }))?;
    Ok(Json(DataResponse {
        data: ExecutionView::from(record),
    }))
}
