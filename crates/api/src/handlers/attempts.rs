//! Handlers for the `/attempts` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::pipelines::Pipeline;
use rigger_core::types::DbId;
use rigger_db::models::attempt::WorkAttempt;
use rigger_db::repositories::{ExecutionRecordRepo, WorkAttemptRepo};

use crate::error::{AppError, AppResult};
use crate::handlers::executions::ExecutionView;
use crate::handlers::{workflow_of, ListQuery};
use crate::response::{DataResponse, EntityView};
use crate::state::AppState;

async fn load_attempt(state: &AppState, id: DbId) -> AppResult<WorkAttempt> {
    WorkAttemptRepo::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "WorkAttempt",
            id,
        }))
}

/// GET /api/v1/attempts/{id}
pub async fn get_attempt(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let attempt = load_attempt(&state, id).await?;
    let workflow = workflow_of(
        EntityRef::attempt(attempt.id),
        &attempt.metadata,
        attempt.metadata_version,
        Pipeline::ProvisionWorkspace,
    );
    Ok(Json(DataResponse {
        data: EntityView {
            entity: attempt,
            workflow,
        },
    }))
}

/// GET /api/v1/attempts/{id}/executions
pub async fn list_attempt_executions(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    load_attempt(&state, id).await?;
    let records = ExecutionRecordRepo::list_for_attempt(&state.pool, id, query.limit()).await?;
    let data: Vec<ExecutionView> = records.into_iter().map(ExecutionView::from).collect();
    Ok(Json(DataResponse { data }))
}

/// POST /api/v1/attempts/{id}/retry
pub async fn retry_attempt(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let attempt = load_attempt(&state, id).await?;
    if !WorkAttemptRepo::request_retry(&state.pool, id).await? {
        return Err(AppError::Core(CoreError::Conflict(format!(
            "Attempt {id} is {} and cannot be retried",
            attempt.status_name
        ))));
    }
    tracing::info!(attempt_id = id, "Attempt queued for retry");

    let attempt = load_attempt(&state, id).await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: attempt })))
}
