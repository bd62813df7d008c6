//! Handlers for the `/hosts` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::pipelines::Pipeline;
use rigger_core::scripts::ScriptJob;
use rigger_core::types::DbId;
use rigger_db::models::execution::NewExecutionRecord;
use rigger_db::models::host::Host;
use rigger_db::repositories::{ExecutionRecordRepo, HostRepo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::handlers::executions::ExecutionView;
use crate::handlers::{workflow_of, ListQuery};
use crate::response::{DataResponse, EntityView};
use crate::state::AppState;

/// Body of `POST /hosts/{id}/scripts`.
#[derive(Debug, Deserialize)]
pub struct RunScriptRequest {
    pub template: String,
    #[serde(default)]
    pub params: Value,
    /// Display name for the record; defaults to the template's.
    pub name: Option<String>,
}

/// Returned when a script is queued.
#[derive(Debug, Serialize)]
pub struct QueuedScript {
    pub execution_id: DbId,
    pub host_id: DbId,
    pub template: &'static str,
    pub name: String,
}

async fn load_host(state: &AppState, id: DbId) -> AppResult<Host> {
    HostRepo::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound { entity: "Host", id }))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// GET /api/v1/hosts/{id}
pub async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let host = load_host(&state, id).await?;
    let workflow = workflow_of(
        EntityRef::host(host.id),
        &host.metadata,
        host.metadata_version,
        Pipeline::ProvisionHost,
    );
    Ok(Json(DataResponse {
        data: EntityView {
            entity: host,
            workflow,
        },
    }))
}

/// GET /api/v1/hosts/{id}/executions
pub async fn list_host_executions(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    load_host(&state, id).await?;
    let records = ExecutionRecordRepo::list_for_host(&state.pool, id, query.limit()).await?;
    let data: Vec<ExecutionView> = records.into_iter().map(ExecutionView::from).collect();
    Ok(Json(DataResponse { data }))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// POST /api/v1/hosts/{id}/reprovision
///
/// Only a failed host can be put back in the queue.
pub async fn reprovision_host(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let host = load_host(&state, id).await?;
    if !HostRepo::request_reprovision(&state.pool, id).await? {
        return Err(AppError::Core(CoreError::Conflict(format!(
            "Host {id} is {} and cannot be reprovisioned",
            host.status_name
        ))));
    }
    tracing::info!(host_id = id, "Host queued for reprovisioning");

    let host = load_host(&state, id).await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: host })))
}

/// POST /api/v1/hosts/{id}/scripts
///
/// Renders the template up front so bad requests fail here instead of in
/// the worker.
pub async fn run_script(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<RunScriptRequest>,
) -> AppResult<impl IntoResponse> {
    load_host(&state, id).await?;

    let job = ScriptJob::from_template(&input.template, input.params)?;
    let script = job.render()?;
    let name = match input.name {
        Some(name) if !name.trim().is_empty() => name,
        Some(_) => {
            return Err(AppError::BadRequest("name must not be blank".into()));
        }
        None => job.display_name().to_string(),
    };

    let record = NewExecutionRecord {
        template: job.template_id().to_string(),
        name: name.clone(),
        script,
        metadata: json!({
            "pipeline": Pipeline::RunScript.name(),
            "step": Pipeline::RunScript.name(),
            "params": job.params(),
        }),
        host_id: Some(id),
        ..Default::default()
    };
    let execution_id = ExecutionRecordRepo::enqueue(&state.pool, &record).await?;
    tracing::info!(host_id = id, execution_id, template = job.template_id(), "Script queued");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: QueuedScript {
                execution_id,
                host_id: id,
                template: job.template_id(),
                name,
            },
        }),
    ))
}
