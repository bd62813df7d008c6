use axum::routing::{get, post};
use axum::Router;

use crate::handlers::hosts;
use crate::state::AppState;

/// Routes mounted at `/hosts`.
///
/// ```text
/// GET    /{id}                      -> get_host
/// GET    /{id}/executions           -> list_host_executions
/// POST   /{id}/reprovision          -> reprovision_host
/// POST   /{id}/scripts              -> run_script
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(hosts::get_host))
        .route("/{id}/executions", get(hosts::list_host_executions))
        .route("/{id}/reprovision", post(hosts::reprovision_host))
        .route("/{id}/scripts", post(hosts::run_script))
}
