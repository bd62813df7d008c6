use axum::routing::get;
use axum::Router;

use crate::handlers::executions;
use crate::state::AppState;

/// Routes mounted at `/executions`.
pub fn router() -> Router<AppState> {
    Router::new().route("/{id}", get(executions::get_execution))
}
