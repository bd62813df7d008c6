pub mod attempts;
pub mod executions;
pub mod health;
pub mod hosts;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /hosts
///     /{id}                                        get
///     /{id}/executions                             list (?limit=)
///     /{id}/reprovision                            reprovision (POST)
///     /{id}/scripts                                run script (POST)
///
/// /attempts
///     /{id}                                        get
///     /{id}/executions                             list (?limit=)
///     /{id}/retry                                  retry (POST)
///
/// /executions
///     /{id}                                        get
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Host provisioning state and single-script requests.
        .nest("/hosts", hosts::router())
        // Workspace attempts.
        .nest("/attempts", attempts::router())
        // Execution record polling.
        .nest("/executions", executions::router())
}
