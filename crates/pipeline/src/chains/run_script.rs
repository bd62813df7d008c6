//! `run-script`: one ad-hoc template against a host.
//!
//! The host's status is left alone; only its workflow view and notes
//! change.

use chrono::Utc;
use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::pipelines::{definitions, Pipeline};
use rigger_core::scripting::executor::{Delivery, ExecutionResult};
use rigger_core::scripts::ScriptTask;
use rigger_core::types::DbId;
use rigger_core::workflow::StepDefinition;
use serde_json::json;

use crate::context::{ChainSettings, StatusTransitions};
use crate::runner::{Chain, ChainStep, StepPolicy};
use crate::step::{Step, StepEffects, StepInput};

pub const KEY_LAST_SCRIPT: &str = "last_script";

/// Build the chain. `preassigned` is the queued record the request created,
/// if any; the script's result is written to it instead of a new one.
pub fn run_script(
    host_id: DbId,
    task: ScriptTask,
    preassigned: Option<DbId>,
    settings: &ChainSettings,
) -> Chain {
    Chain {
        pipeline: Pipeline::RunScript,
        entity: EntityRef::host(host_id),
        steps: vec![ChainStep::new(
            RunScriptStep { task },
            StepPolicy::with_timeout(settings.script_timeout),
        )],
        transitions: StatusTransitions::default(),
        preassigned_execution: preassigned,
    }
}

struct RunScriptStep {
    task: ScriptTask,
}

impl Step for RunScriptStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::RUN_SCRIPT
    }

    fn delivery(&self) -> Delivery {
        Delivery::Stdin
    }

    fn prepare(&self, _input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(self.task.clone())
    }

    fn on_success(
        &self,
        result: &ExecutionResult,
        _input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        Ok(StepEffects::default().with(
            KEY_LAST_SCRIPT,
            json!({
                "template": self.task.job.template_id(),
                "name": self.task.name,
                "duration_ms": result.duration_ms,
                "finished_at": Utc::now().to_rfc3339(),
            }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rigger_core::scripts::ScriptJob;

    use super::*;

    #[test]
    fn script_chains_leave_host_status_alone() {
        let task = ScriptTask::new(ScriptJob::UpdatePackages);
        let chain = run_script(3, task, Some(41), &ChainSettings::default());
        assert_eq!(chain.transitions, StatusTransitions::default());
        assert_eq!(chain.preassigned_execution, Some(41));
        assert_eq!(chain.definitions(), Pipeline::RunScript.steps());
        assert_eq!(
            chain.steps[0].policy.timeout,
            ChainSettings::default().script_timeout
        );
    }
}
