//! `provision-workspace`: one compose project per work attempt.
//!
//! Each step leaves what the next one needs in the attempt's metadata:
//! `create-user` fixes the names and directory, `find-free-port` the host
//! port, `start-compose` the container identity.

use chrono::Utc;
use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::extractor::{
    extract_containers, extract_first, primary_published_port, ContainerInfo, Sentinel, FREE_PORT,
};
use rigger_core::pipelines::{definitions, Pipeline};
use rigger_core::scripting::executor::{Delivery, ExecutionResult};
use rigger_core::scripts::{
    ComposeConfigParams, ComposeProjectParams, CreateUserParams, FindFreePortParams, ScriptJob,
    ScriptTask, SetAccessParams,
};
use rigger_core::status::AttemptStatus;
use rigger_core::types::DbId;
use rigger_core::workflow::StepDefinition;
use rigger_db::models::attempt::ContainerIdentity;
use serde::Deserialize;
use serde_json::Value;

use crate::context::{ChainSettings, StatusTransitions};
use crate::runner::{Chain, ChainStep, StepPolicy};
use crate::step::{Step, StepEffects, StepInput};
use crate::store::EntityStatus;

pub const KEY_USERNAME: &str = "username";
pub const KEY_WORKDIR: &str = "workdir";
pub const KEY_PROJECT: &str = "project";
pub const KEY_HOST_PORT: &str = "host_port";
pub const KEY_CONTAINER_ID: &str = "container_id";
pub const KEY_CONTAINER_NAME: &str = "container_name";
pub const KEY_CONTAINER_PORT: &str = "container_port";
pub const KEY_READY_AT: &str = "ready_at";

/// Port the workspace image listens on inside its container.
pub const WORKSPACE_CONTAINER_PORT: u16 = 8080;

pub fn provision_workspace(attempt_id: DbId, settings: &ChainSettings) -> Chain {
    let policy = StepPolicy::with_timeout(settings.step_timeout);
    Chain {
        pipeline: Pipeline::ProvisionWorkspace,
        entity: EntityRef::attempt(attempt_id),
        steps: vec![
            ChainStep::new(CreateUserStep, policy),
            ChainStep::new(FindFreePortStep, policy),
            ChainStep::new(WriteComposeConfigStep, policy),
            ChainStep::new(StartComposeStep, policy),
            ChainStep::new(SetAccessStep, policy),
            ChainStep::new(VerifyStep, policy),
        ],
        transitions: StatusTransitions {
            running: None,
            completed: Some(EntityStatus::Attempt(AttemptStatus::Running)),
            failed: Some(EntityStatus::Attempt(AttemptStatus::Failed)),
        },
        preassigned_execution: None,
    }
}

/// `ws-<attempt id>`: user name and compose project of an attempt.
pub fn workspace_name(attempt_id: DbId) -> String {
    format!("ws-{attempt_id}")
}

fn workspace_dir(settings: &ChainSettings, name: &str) -> String {
    format!("{}/{name}", settings.workspace_root.trim_end_matches('/'))
}

fn compose_project(input: &StepInput<'_>) -> Result<ComposeProjectParams, CoreError> {
    Ok(ComposeProjectParams {
        workdir: input.bag.get_as(KEY_WORKDIR)?,
        project: input.bag.get_as(KEY_PROJECT)?,
    })
}

fn container_identity(containers: &[ContainerInfo]) -> Result<ContainerIdentity, CoreError> {
    let first = containers
        .first()
        .ok_or_else(|| CoreError::Extraction("no container info returned".to_string()))?;
    Ok(ContainerIdentity {
        container_id: first.id.clone(),
        container_name: first.name.clone(),
        container_port: primary_published_port(containers).map(i32::from),
    })
}

fn container_effects(container: ContainerIdentity) -> StepEffects {
    let port = container
        .container_port
        .map(Value::from)
        .unwrap_or(Value::Null);
    let mut effects = StepEffects::default()
        .with(KEY_CONTAINER_ID, container.container_id.as_str())
        .with(KEY_CONTAINER_NAME, container.container_name.as_str())
        .with(KEY_CONTAINER_PORT, port);
    effects.container = Some(container);
    effects
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

struct CreateUserStep;

impl Step for CreateUserStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::CREATE_USER
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        let name = workspace_name(input.require_attempt()?.id);
        Ok(ScriptTask::new(ScriptJob::CreateUser(CreateUserParams {
            workdir: workspace_dir(input.settings, &name),
            username: name,
        })))
    }

    fn on_success(
        &self,
        _result: &ExecutionResult,
        input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        let name = workspace_name(input.require_attempt()?.id);
        Ok(StepEffects::default()
            .with(KEY_USERNAME, name.as_str())
            .with(KEY_WORKDIR, workspace_dir(input.settings, &name))
            .with(KEY_PROJECT, name))
    }
}

struct FindFreePortStep;

#[derive(Deserialize)]
struct FreePort {
    port: u16,
}

impl Step for FindFreePortStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::FIND_FREE_PORT
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(ScriptTask::new(ScriptJob::FindFreePort(FindFreePortParams {
            range: input.settings.port_range,
        })))
    }

    fn on_success(
        &self,
        result: &ExecutionResult,
        _input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        let found: FreePort = extract_first(&result.output, &Sentinel::named(FREE_PORT))
            .ok_or_else(|| CoreError::Extraction("no free port reported".to_string()))?;
        Ok(StepEffects::default().with(KEY_HOST_PORT, found.port))
    }
}

struct WriteComposeConfigStep;

impl Step for WriteComposeConfigStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::WRITE_COMPOSE_CONFIG
    }

    // The script carries a heredoc; stdin keeps it off the remote disk.
    fn delivery(&self) -> Delivery {
        Delivery::Stdin
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        let bag = input.bag;
        Ok(ScriptTask::new(ScriptJob::WriteComposeConfig(
            ComposeConfigParams {
                workdir: bag.get_as(KEY_WORKDIR)?,
                project: bag.get_as(KEY_PROJECT)?,
                image: input.settings.workspace_image.clone(),
                username: bag.get_as(KEY_USERNAME)?,
                host_port: bag.get_as(KEY_HOST_PORT)?,
                container_port: WORKSPACE_CONTAINER_PORT,
            },
        )))
    }
}

struct StartComposeStep;

impl Step for StartComposeStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::START_COMPOSE
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(ScriptTask::new(ScriptJob::StartCompose(compose_project(
            input,
        )?)))
    }

    fn on_success(
        &self,
        result: &ExecutionResult,
        _input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        let containers = extract_containers(&result.output);
        Ok(container_effects(container_identity(&containers)?))
    }
}

struct SetAccessStep;

impl Step for SetAccessStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::SET_ACCESS
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(ScriptTask::new(ScriptJob::SetAccess(SetAccessParams {
            username: input.bag.get_as(KEY_USERNAME)?,
            workdir: input.bag.get_as(KEY_WORKDIR)?,
        })))
    }
}

/// Confirms the container is up and refreshes its identity, which may have
/// changed if compose recreated it.
struct VerifyStep;

impl Step for VerifyStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::FINALIZE
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(ScriptTask::new(ScriptJob::VerifyWorkspace(compose_project(
            input,
        )?)))
    }

    fn on_success(
        &self,
        result: &ExecutionResult,
        _input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        let containers = extract_containers(&result.output);
        let effects = match container_identity(&containers) {
            Ok(container) => container_effects(container),
            Err(_) => StepEffects::default(),
        };
        Ok(effects.with(KEY_READY_AT, Utc::now().to_rfc3339()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
