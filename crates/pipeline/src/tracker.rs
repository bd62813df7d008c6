//! Workflow progress stored in an entity's metadata bag.
//!
//! `current_step` and `step_history[step]` are written by separate calls,
//! so an observer reading between the two can see the pointer one step
//! behind the history. Each write is atomic on its own.

use std::sync::Arc;

use chrono::Utc;
use rigger_core::channels::EVENT_WORKFLOW_UPDATED;
use rigger_core::entity::EntityRef;
use rigger_core::metadata::{
    MergeMode, MetadataBag, KEY_CURRENT_STEP, KEY_STEP_HISTORY, KEY_WORKFLOW, WORKFLOW_KEYS,
};
use rigger_core::pipelines::Pipeline;
use rigger_core::workflow::{project, CurrentStep, StepDefinition, StepStatus, WorkflowState};
use rigger_events::{ChangeEvent, EventBus};
use serde_json::{json, Map, Value};

use crate::error::PipelineResult;
use crate::store::{EntityStatus, EntityStore};

/// Progress tracker of one chain run on one entity.
pub struct StepTracker {
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
    entity: EntityRef,
    pipeline: Pipeline,
    definitions: Vec<StepDefinition>,
}

impl StepTracker {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Arc<EventBus>,
        entity: EntityRef,
        pipeline: Pipeline,
        definitions: Vec<StepDefinition>,
    ) -> Self {
        Self {
            store,
            bus,
            entity,
            pipeline,
            definitions,
        }
    }

    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn definitions(&self) -> &[StepDefinition] {
        &self.definitions
    }

    /// Reset the workflow keys for a fresh run and optionally move the
    /// entity into its running status.
    pub async fn begin(&self, running: Option<EntityStatus>) -> PipelineResult<()> {
        let workflow = self.pipeline.name();
        self.store
            .update_metadata(
                self.entity,
                Box::new(move |bag| {
                    bag.remove(&WORKFLOW_KEYS);
                    let mut partial = Map::new();
                    partial.insert(KEY_WORKFLOW.to_string(), json!(workflow));
                    bag.merge(partial, MergeMode::Overwrite);
                }),
            )
            .await?;
        if let Some(status) = running {
            self.store.set_status(self.entity, status).await?;
        }
        self.publish(EVENT_WORKFLOW_UPDATED).await;
        Ok(())
    }

    /// Point `current_step` at `current`; `Idle` removes the key.
    pub async fn set_current(&self, current: &CurrentStep) -> PipelineResult<()> {
        let stored = current.as_stored().map(str::to_string);
        self.store
            .update_metadata(
                self.entity,
                Box::new(move |bag| match stored {
                    Some(step) => {
                        let mut partial = Map::new();
                        partial.insert(KEY_CURRENT_STEP.to_string(), Value::String(step));
                        bag.merge(partial, MergeMode::Overwrite);
                    }
                    None => bag.remove(&[KEY_CURRENT_STEP]),
                }),
            )
            .await?;
        self.publish(EVENT_WORKFLOW_UPDATED).await;
        Ok(())
    }

    /// Overwrite `fields` inside `step_history[step_id]`, leaving the other
    /// fields of the entry and `current_step` untouched.
    pub async fn update_step(&self, step_id: &str, fields: Map<String, Value>) -> PipelineResult<()> {
        let step_id = step_id.to_string();
        self.store
            .update_metadata(
                self.entity,
                Box::new(move |bag| {
                    let mut history = match bag.get_opt(KEY_STEP_HISTORY) {
                        Some(Value::Object(history)) => history.clone(),
                        _ => Map::new(),
                    };
                    let entry = history
                        .entry(step_id)
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !entry.is_object() {
                        *entry = Value::Object(Map::new());
                    }
                    if let Value::Object(entry) = entry {
                        entry.extend(fields);
                    }
                    let mut partial = Map::new();
                    partial.insert(KEY_STEP_HISTORY.to_string(), Value::Object(history));
                    bag.merge(partial, MergeMode::Overwrite);
                }),
            )
            .await?;
        self.publish(EVENT_WORKFLOW_UPDATED).await;
        Ok(())
    }

    pub async fn start_step(&self, step_id: &str) -> PipelineResult<()> {
        self.update_step(
            step_id,
            fields(json!({
                "status": StepStatus::InProgress,
                "started_at": Utc::now(),
            })),
        )
        .await
    }

    pub async fn complete_step(&self, step_id: &str) -> PipelineResult<()> {
        self.update_step(
            step_id,
            fields(json!({
                "status": StepStatus::Completed,
                "completed_at": Utc::now(),
            })),
        )
        .await
    }

    pub async fn fail_step(&self, step_id: &str, message: &str) -> PipelineResult<()> {
        self.update_step(
            step_id,
            fields(json!({
                "status": StepStatus::Failed,
                "failed_at": Utc::now(),
                "error_message": message,
            })),
        )
        .await
    }

    /// Project the current bag against this chain's steps. Performs no writes.
    pub async fn state(&self) -> PipelineResult<WorkflowState> {
        let bag = self.store.metadata(self.entity).await?;
        Ok(project(&self.definitions, &bag))
    }

    /// Publish the entity's current view under `event`.
    ///
    /// Fire-and-forget: a failure to build the payload is logged, never
    /// returned.
    pub async fn publish(&self, event: &str) {
        match self.payload().await {
            Ok(payload) => self
                .bus
                .publish(ChangeEvent::for_entity(self.entity, event).with_payload(payload)),
            Err(e) => tracing::warn!(
                entity = %self.entity,
                event,
                error = %e,
                "Failed to build change payload",
            ),
        }
    }

    async fn payload(&self) -> PipelineResult<Value> {
        let bag = self.store.metadata(self.entity).await?;
        let status = self.store.status_name(self.entity).await?;
        Ok(change_payload(self.entity, &status, &bag, &self.definitions))
    }
}

/// `{id, status, currentStep, metadata, workflow}` as sent to observers.
pub fn change_payload(
    entity: EntityRef,
    status: &str,
    bag: &MetadataBag,
    definitions: &[StepDefinition],
) -> Value {
    let workflow = project(definitions, bag);
    json!({
        "id": entity.id,
        "status": status,
        "currentStep": workflow.current_step,
        "metadata": bag.to_value(),
        "workflow": workflow,
    })
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
