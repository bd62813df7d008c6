pub mod attempts;
pub mod executions;
pub mod hosts;

use rigger_core::entity::EntityRef;
use rigger_core::metadata::{MetadataBag, KEY_WORKFLOW};
use rigger_core::pipelines::Pipeline;
use rigger_core::workflow::{project, WorkflowState};
use serde::Deserialize;
use serde_json::Value;

/// Default page size for execution listings.
const DEFAULT_LIMIT: i64 = 20;

/// `?limit=` on listings.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

impl ListQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Project the workflow stored in an entity's bag.
///
/// The pipeline is the one named in the bag; `fallback` applies before any
/// chain has run.
pub fn workflow_of(
    entity: EntityRef,
    metadata: &Value,
    version: i64,
    fallback: Pipeline,
) -> WorkflowState {
    let bag = MetadataBag::new(entity, metadata.clone(), version);
    let pipeline = bag
        .get_opt(KEY_WORKFLOW)
        .and_then(Value::as_str)
        .and_then(Pipeline::from_name)
        .unwrap_or(fallback);
    project(pipeline.steps(), &bag)
}
