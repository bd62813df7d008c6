//! Fixed pipeline shapes.
//!
//! Which steps a chain runs, and in which order, is decided here at build
//! time. Observers receive the same definitions through the workflow
//! projection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityKind;
use crate::workflow::StepDefinition;

/// Step identifiers. These double as `step_history` keys.
pub mod step_ids {
    pub const START: &str = "start";
    pub const UPDATE_PACKAGES: &str = "update-packages";
    pub const INSTALL_PACKAGES: &str = "install-packages";
    pub const INSTALL_RUNTIME: &str = "install-runtime";
    pub const UPDATE_FIREWALL: &str = "update-firewall";
    pub const INSTALL_REVERSE_PROXY: &str = "install-reverse-proxy";

    pub const CREATE_USER: &str = "create-user";
    pub const FIND_FREE_PORT: &str = "find-free-port";
    pub const WRITE_COMPOSE_CONFIG: &str = "write-compose-config";
    pub const START_COMPOSE: &str = "start-compose";
    pub const SET_ACCESS: &str = "set-access";
    pub const FINALIZE: &str = "finalize";

    pub const RUN_SCRIPT: &str = "run-script";
}

/// Step definitions, one per step id.
pub mod definitions {
    use super::step_ids;
    use crate::workflow::StepDefinition;

    pub const START: StepDefinition = StepDefinition {
        id: step_ids::START,
        label: "Connect",
        description: "Verify the host is reachable and collect system facts",
        icon: "plug",
        estimated_secs: 10,
    };

    pub const UPDATE_PACKAGES: StepDefinition = StepDefinition {
        id: step_ids::UPDATE_PACKAGES,
        label: "Update packages",
        description: "Refresh package indexes and apply pending upgrades",
        icon: "refresh",
        estimated_secs: 180,
    };

    pub const INSTALL_PACKAGES: StepDefinition = StepDefinition {
        id: step_ids::INSTALL_PACKAGES,
        label: "Install packages",
        description: "Install the base tool set",
        icon: "package",
        estimated_secs: 120,
    };

    pub const INSTALL_RUNTIME: StepDefinition = StepDefinition {
        id: step_ids::INSTALL_RUNTIME,
        label: "Install container runtime",
        description: "Install Docker Engine and the compose plugin",
        icon: "box",
        estimated_secs: 240,
    };

    pub const UPDATE_FIREWALL: StepDefinition = StepDefinition {
        id: step_ids::UPDATE_FIREWALL,
        label: "Configure firewall",
        description: "Allow SSH, HTTP(S) and the workspace port range",
        icon: "shield",
        estimated_secs: 20,
    };

    pub const INSTALL_REVERSE_PROXY: StepDefinition = StepDefinition {
        id: step_ids::INSTALL_REVERSE_PROXY,
        label: "Install reverse proxy",
        description: "Install and enable the HTTP reverse proxy",
        icon: "globe",
        estimated_secs: 90,
    };

    pub const CREATE_USER: StepDefinition = StepDefinition {
        id: step_ids::CREATE_USER,
        label: "Create user",
        description: "Create the workspace system user and home directory",
        icon: "user",
        estimated_secs: 5,
    };

    pub const FIND_FREE_PORT: StepDefinition = StepDefinition {
        id: step_ids::FIND_FREE_PORT,
        label: "Allocate port",
        description: "Find a free port in the workspace range",
        icon: "hash",
        estimated_secs: 5,
    };

    pub const WRITE_COMPOSE_CONFIG: StepDefinition = StepDefinition {
        id: step_ids::WRITE_COMPOSE_CONFIG,
        label: "Write configuration",
        description: "Write the compose file for the workspace container",
        icon: "file",
        estimated_secs: 5,
    };

    pub const START_COMPOSE: StepDefinition = StepDefinition {
        id: step_ids::START_COMPOSE,
        label: "Start container",
        description: "Pull the image and start the workspace container",
        icon: "play",
        estimated_secs: 120,
    };

    pub const SET_ACCESS: StepDefinition = StepDefinition {
        id: step_ids::SET_ACCESS,
        label: "Set permissions",
        description: "Hand the workspace directory to the workspace user",
        icon: "lock",
        estimated_secs: 5,
    };

    pub const FINALIZE: StepDefinition = StepDefinition {
        id: step_ids::FINALIZE,
        label: "Finalize",
        description: "Verify the container is running",
        icon: "check",
        estimated_secs: 5,
    };

    pub const RUN_SCRIPT: StepDefinition = StepDefinition {
        id: step_ids::RUN_SCRIPT,
        label: "Run script",
        description: "Run a single rendered script against the host",
        icon: "terminal",
        estimated_secs: 300,
    };
}

const PROVISION_HOST_STEPS: &[StepDefinition] = &[
    definitions::START,
    definitions::UPDATE_PACKAGES,
    definitions::INSTALL_PACKAGES,
    definitions::INSTALL_RUNTIME,
    definitions::UPDATE_FIREWALL,
    definitions::INSTALL_REVERSE_PROXY,
];

const PROVISION_WORKSPACE_STEPS: &[StepDefinition] = &[
    definitions::CREATE_USER,
    definitions::FIND_FREE_PORT,
    definitions::WRITE_COMPOSE_CONFIG,
    definitions::START_COMPOSE,
    definitions::SET_ACCESS,
    definitions::FINALIZE,
];

const RUN_SCRIPT_STEPS: &[StepDefinition] = &[
    definitions::RUN_SCRIPT,
];

/// The pipelines the orchestrator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pipeline {
    ProvisionHost,
    ProvisionWorkspace,
    RunScript,
}

impl Pipeline {
    pub fn name(self) -> &'static str {
        match self {
            Self::ProvisionHost => "provision-host",
            Self::ProvisionWorkspace => "provision-workspace",
            Self::RunScript => "run-script",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "provision-host" => Some(Self::ProvisionHost),
            "provision-workspace" => Some(Self::ProvisionWorkspace),
            "run-script" => Some(Self::RunScript),
            _ => None,
        }
    }

    /// The ordered step definitions of this pipeline.
    pub fn steps(self) -> &'static [StepDefinition] {
        match self {
            Self::ProvisionHost => PROVISION_HOST_STEPS,
            Self::ProvisionWorkspace => PROVISION_WORKSPACE_STEPS,
            Self::RunScript => RUN_SCRIPT_STEPS,
        }
    }

    pub fn step(self, id: &str) -> Option<&'static StepDefinition> {
        self.steps().iter().find(|s| s.id == id)
    }

    /// The entity kind whose metadata tracks this pipeline.
    pub fn owner_kind(self) -> EntityKind {
        match self {
            Self::ProvisionHost | Self::RunScript => EntityKind::Host,
            Self::ProvisionWorkspace => EntityKind::WorkAttempt,
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
