//! The unit of work of a chain.

use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::metadata::MetadataBag;
use rigger_core::scripting::executor::{Delivery, ExecutionResult};
use rigger_core::scripts::ScriptTask;
use rigger_core::workflow::StepDefinition;
use rigger_db::models::attempt::ContainerIdentity;
use serde_json::{Map, Value};

use crate::context::ChainSettings;
use crate::store::{AttemptInfo, HostInfo};

/// What a step can see when it builds its script or reads its output.
///
/// `bag` is loaded right before the step runs; it is the only state handed
/// over from earlier steps.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub entity: EntityRef,
    pub bag: &'a MetadataBag,
    pub settings: &'a ChainSettings,
    pub host: Option<&'a HostInfo>,
    pub attempt: Option<&'a AttemptInfo>,
}

impl StepInput<'_> {
    /// The attempt of a workspace chain.
    pub fn require_attempt(&self) -> Result<&AttemptInfo, CoreError> {
        self.attempt.ok_or_else(|| {
            CoreError::Internal(format!("{} is not a work attempt", self.entity))
        })
    }
}

/// State a successful step writes back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepEffects {
    /// Merged into the bag with overwrite semantics.
    pub metadata: Map<String, Value>,
    /// Stored on the work attempt.
    pub container: Option<ContainerIdentity>,
}

impl StepEffects {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// One step of a chain: which script to run and what to keep from it.
///
/// Steps are pure: the orchestrator owns every side effect (execution
/// record, metadata, notes, status, events).
pub trait Step: Send + Sync {
    fn definition(&self) -> &StepDefinition;

    fn delivery(&self) -> Delivery {
        Delivery::TempFile
    }

    /// Build the script task. Fails on missing metadata or invalid
    /// parameters, before anything is spawned.
    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError>;

    /// Read the output of a zero exit. An error here fails the step even
    /// though the script succeeded.
    fn on_success(
        &self,
        _result: &ExecutionResult,
        _input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        Ok(StepEffects::default())
    }
}
