//! Per-run state shared by every step of a chain.

use std::sync::Arc;
use std::time::Duration;

use rigger_core::entity::EntityRef;
use rigger_core::metadata::MetadataBag;
use rigger_core::pipelines::Pipeline;
use rigger_core::scripting::executor::ScriptExecutor;
use rigger_core::scripting::target::ExecutionTarget;
use rigger_core::scripts::{PortRange, ScriptTask};
use rigger_core::types::DbId;
use rigger_db::models::execution::NewExecutionRecord;
use serde_json::json;
use tokio::sync::Mutex;

use crate::audit::AuditLog;
use crate::step::StepInput;
use crate::store::{AttemptInfo, EntityStatus, EntityStore, ExecutionStore, HostInfo};
use crate::tracker::StepTracker;

/// Deployment-level knobs the chains read.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Parent directory of all workspace directories on a host.
    pub workspace_root: String,
    pub workspace_image: String,
    pub port_range: PortRange,
    /// Default per-step timeout.
    pub step_timeout: Duration,
    /// Timeout of single-script chains.
    pub script_timeout: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            workspace_root: "/srv/workspaces".to_string(),
            workspace_image: "codercom/code-server:latest".to_string(),
            port_range: PortRange::default(),
            step_timeout: Duration::from_secs(900),
            script_timeout: Duration::from_secs(3600),
        }
    }
}

/// Entity statuses a chain moves through. `None` leaves the status alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusTransitions {
    pub running: Option<EntityStatus>,
    pub completed: Option<EntityStatus>,
    pub failed: Option<EntityStatus>,
}

/// Services and identity of one chain run.
pub struct ChainContext {
    pub pipeline: Pipeline,
    pub entity: EntityRef,
    pub host: Option<HostInfo>,
    pub attempt: Option<AttemptInfo>,
    pub transitions: StatusTransitions,
    pub settings: Arc<ChainSettings>,
    pub store: Arc<dyn EntityStore>,
    pub records: Arc<dyn ExecutionStore>,
    pub executor: Arc<dyn ScriptExecutor>,
    pub tracker: StepTracker,
    pub audit: AuditLog,
    preassigned: Mutex<Option<DbId>>,
    active_execution: Mutex<Option<DbId>>,
}

/// Everything [`ChainContext::new`] needs besides the services.
pub struct ContextParts {
    pub pipeline: Pipeline,
    pub entity: EntityRef,
    pub host: Option<HostInfo>,
    pub attempt: Option<AttemptInfo>,
    pub transitions: StatusTransitions,
    pub preassigned_execution: Option<DbId>,
}

impl ChainContext {
    pub fn new(
        parts: ContextParts,
        settings: Arc<ChainSettings>,
        store: Arc<dyn EntityStore>,
        records: Arc<dyn ExecutionStore>,
        executor: Arc<dyn ScriptExecutor>,
        tracker: StepTracker,
    ) -> Self {
        Self {
            pipeline: parts.pipeline,
            entity: parts.entity,
            host: parts.host,
            attempt: parts.attempt,
            transitions: parts.transitions,
            audit: AuditLog::new(Arc::clone(&store)),
            settings,
            store,
            records,
            executor,
            tracker,
            preassigned: Mutex::new(parts.preassigned_execution),
            active_execution: Mutex::new(None),
        }
    }

    /// Remote when the chain has a host, local otherwise.
    pub fn target(&self) -> ExecutionTarget {
        match &self.host {
            Some(host) => ExecutionTarget::Remote(host.target.clone()),
            None => ExecutionTarget::Local,
        }
    }

    pub fn step_input<'a>(&'a self, bag: &'a MetadataBag) -> StepInput<'a> {
        StepInput {
            entity: self.entity,
            bag,
            settings: &self.settings,
            host: self.host.as_ref(),
            attempt: self.attempt.as_ref(),
        }
    }

    /// The record insert for one rendered task.
    pub fn new_record(&self, step_id: &str, task: &ScriptTask, script: &str) -> NewExecutionRecord {
        NewExecutionRecord {
            template: task.job.template_id().to_string(),
            name: task.name.clone(),
            script: script.to_string(),
            metadata: json!({
                "pipeline": self.pipeline.name(),
                "step": step_id,
                "params": task.job.params(),
            }),
            user_id: self.attempt.map(|a| a.user_id),
            host_id: self.host.as_ref().map(|h| h.id),
            task_id: self.attempt.map(|a| a.task_id),
            attempt_id: self.attempt.map(|a| a.id),
        }
    }

    /// A record created before the chain started, used by the first step
    /// that runs a script.
    pub async fn take_preassigned(&self) -> Option<DbId> {
        self.preassigned.lock().await.take()
    }

    /// The record of the script currently running, if any.
    pub async fn set_active(&self, id: Option<DbId>) {
        *self.active_execution.lock().await = id;
    }

    pub async fn take_active(&self) -> Option<DbId> {
        self.active_execution.lock().await.take()
    }
}
