//! The pipelines the worker runs, built as [`Chain`](crate::runner::Chain)s.

pub mod host;
pub mod run_script;
pub mod workspace;

use rigger_core::error::CoreError;
use rigger_core::scripting::executor::Delivery;
use rigger_core::scripts::{ScriptJob, ScriptTask};
use rigger_core::workflow::StepDefinition;

use crate::step::{Step, StepInput};

pub use host::provision_host;
pub use run_script::run_script;
pub use workspace::provision_workspace;

/// A step whose job does not depend on runtime state.
pub struct FixedStep {
    definition: StepDefinition,
    job: ScriptJob,
    delivery: Delivery,
}

impl FixedStep {
    pub fn new(definition: StepDefinition, job: ScriptJob) -> Self {
        Self {
            definition,
            job,
            delivery: Delivery::TempFile,
        }
    }

    pub fn via_stdin(mut self) -> Self {
        self.delivery = Delivery::Stdin;
        self
    }
}

impl Step for FixedStep {
    fn definition(&self) -> &StepDefinition {
        &self.definition
    }

    fn delivery(&self) -> Delivery {
        self.delivery
    }

    fn prepare(&self, _input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(ScriptTask::new(self.job.clone()))
    }
}
