use axum::routing::{get, post};
use axum::Router;

use crate::handlers::attempts;
use crate::state::AppState;

/// Routes mounted at `/attempts`.
///
/// ```text
/// GET    /{id}                      -> get_attempt
/// GET    /{id}/executions           -> list_attempt_executions
/// POST   /{id}/retry                -> retry_attempt
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(attempts::get_attempt))
        .route("/{id}/executions", get(attempts::list_attempt_executions))
        .route("/{id}/retry", post(attempts::retry_attempt))
}
