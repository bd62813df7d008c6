//! `provision-host`: bring a fresh machine up to a workspace host.

use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::pipelines::{definitions, Pipeline};
use rigger_core::scripting::executor::ExecutionResult;
use rigger_core::scripts::{FirewallParams, InstallPackagesParams, ScriptJob, ScriptTask};
use rigger_core::status::HostStatus;
use rigger_core::types::DbId;
use rigger_core::workflow::StepDefinition;

use super::FixedStep;
use crate::context::{ChainSettings, StatusTransitions};
use crate::runner::{Chain, ChainStep, StepPolicy};
use crate::step::{Step, StepEffects, StepInput};
use crate::store::EntityStatus;

pub const KEY_OS: &str = "os";
pub const KEY_OS_VERSION: &str = "os_version";

pub fn provision_host(host_id: DbId, settings: &ChainSettings) -> Chain {
    let policy = StepPolicy::with_timeout(settings.step_timeout);
    Chain {
        pipeline: Pipeline::ProvisionHost,
        entity: EntityRef::host(host_id),
        steps: vec![
            ChainStep::new(ConnectionCheckStep, policy),
            ChainStep::new(
                FixedStep::new(definitions::UPDATE_PACKAGES, ScriptJob::UpdatePackages),
                policy,
            ),
            ChainStep::new(
                FixedStep::new(
                    definitions::INSTALL_PACKAGES,
                    ScriptJob::InstallPackages(InstallPackagesParams::default()),
                ),
                policy,
            ),
            ChainStep::new(
                FixedStep::new(definitions::INSTALL_RUNTIME, ScriptJob::InstallRuntime),
                policy,
            ),
            ChainStep::new(FirewallStep, policy),
            ChainStep::new(
                FixedStep::new(
                    definitions::INSTALL_REVERSE_PROXY,
                    ScriptJob::InstallReverseProxy,
                ),
                policy,
            ),
        ],
        transitions: StatusTransitions {
            running: Some(EntityStatus::Host(HostStatus::Provisioning)),
            completed: Some(EntityStatus::Host(HostStatus::Provisioned)),
            failed: Some(EntityStatus::Host(HostStatus::Failed)),
        },
        preassigned_execution: None,
    }
}

/// Checks the host answers and records its OS release when it reports one.
struct ConnectionCheckStep;

impl Step for ConnectionCheckStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::START
    }

    fn prepare(&self, _input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        Ok(ScriptTask::new(ScriptJob::CheckConnection))
    }

    fn on_success(
        &self,
        result: &ExecutionResult,
        _input: &StepInput<'_>,
    ) -> Result<StepEffects, CoreError> {
        let mut effects = StepEffects::default();
        if let Some((os, version)) = parse_os_release(&result.output) {
            effects = effects.with(KEY_OS, os).with(KEY_OS_VERSION, version);
        }
        Ok(effects)
    }
}

/// `os=debian version=12` as printed by the connection check.
fn parse_os_release(stdout: &str) -> Option<(String, String)> {
    let line = stdout.lines().find(|l| l.starts_with("os="))?;
    let mut os = None;
    let mut version = None;
    for field in line.split_whitespace() {
        match field.split_once('=') {
            Some(("os", value)) => os = Some(value.to_string()),
            Some(("version", value)) => version = Some(value.to_string()),
            _ => {}
        }
    }
    Some((os?, version?))
}

/// Opens the host's SSH port and the workspace port range.
struct FirewallStep;

impl Step for FirewallStep {
    fn definition(&self) -> &StepDefinition {
        &definitions::UPDATE_FIREWALL
    }

    fn prepare(&self, input: &StepInput<'_>) -> Result<ScriptTask, CoreError> {
        let mut params = FirewallParams {
            workspace_ports: input.settings.port_range,
            ..FirewallParams::default()
        };
        if let Some(host) = input.host {
            params.ssh_port = host.target.port;
        }
        Ok(ScriptTask::new(ScriptJob::UpdateFirewall(params)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
