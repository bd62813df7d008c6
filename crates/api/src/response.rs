//! Shared response envelope types for API handlers.
//!
//! All API responses use a `{ "data": ... }` envelope.

use rigger_core::workflow::WorkflowState;
use serde::Serialize;

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

/// A host or work attempt together with its projected workflow.
#[derive(Debug, Serialize)]
pub struct EntityView<T: Serialize> {
    #[serde(flatten)]
    pub entity: T,
    pub workflow: WorkflowState,
}
