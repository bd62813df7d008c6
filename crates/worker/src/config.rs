use std::time::Duration;

use rigger_core::scripting::shell::SshSettings;
use rigger_core::scripts::PortRange;
use rigger_pipeline::context::ChainSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub poll_interval: Duration,
    /// Upper bound on chains running at once in this process.
    pub max_concurrent_chains: usize,
    pub step_timeout: Duration,
    pub script_timeout: Duration,
    /// Where change events are relayed, if anywhere.
    pub change_webhook_url: Option<String>,
    pub ssh: SshSettings,
    pub workspace_root: String,
    pub workspace_image: String,
    pub port_range: PortRange,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                       |
    /// |-------------------------|-------------------------------|
    /// | `DATABASE_URL`          | required                      |
    /// | `POLL_INTERVAL_MS`      | `1000`                        |
    /// | `MAX_CONCURRENT_CHAINS` | `4`                           |
    /// | `STEP_TIMEOUT_SECS`     | `900`                         |
    /// | `SCRIPT_TIMEOUT_SECS`   | `3600`                        |
    /// | `CHANGE_WEBHOOK_URL`    | unset (no relay)              |
    /// | `SSH_BINARY`            | `ssh`                         |
    /// | `SSHPASS_BINARY`        | `sshpass`                     |
    /// | `WORKSPACE_ROOT`        | `/srv/workspaces`             |
    /// | `WORKSPACE_IMAGE`       | `codercom/code-server:latest` |
    /// | `WORKSPACE_PORT_RANGE`  | `20000-29999`                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let chain_defaults = ChainSettings::default();
        let ssh_defaults = SshSettings::default();

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let poll_interval_ms: u64 = parse(&var, "POLL_INTERVAL_MS", 1000, "a number of milliseconds")?;
        let max_concurrent_chains: usize =
            parse(&var, "MAX_CONCURRENT_CHAINS", 4, "a positive integer")?;
        if max_concurrent_chains == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_CONCURRENT_CHAINS",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        let step_timeout_secs: u64 = parse(
            &var,
            "STEP_TIMEOUT_SECS",
            chain_defaults.step_timeout.as_secs(),
            "a number of seconds",
        )?;
        let script_timeout_secs: u64 = parse(
            &var,
            "SCRIPT_TIMEOUT_SECS",
            chain_defaults.script_timeout.as_secs(),
            "a number of seconds",
        )?;

        let port_range = match var("WORKSPACE_PORT_RANGE") {
            Some(value) => PortRange::parse(&value).ok_or(ConfigError::Invalid {
                var: "WORKSPACE_PORT_RANGE",
                value,
                expected: "a range like 20000-29999",
            })?,
            None => chain_defaults.port_range,
        };

        Ok(Self {
            database_url,
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            max_concurrent_chains,
            step_timeout: Duration::from_secs(step_timeout_secs),
            script_timeout: Duration::from_secs(script_timeout_secs),
            change_webhook_url: var("CHANGE_WEBHOOK_URL"),
            ssh: SshSettings {
                ssh_binary: var("SSH_BINARY").unwrap_or(ssh_defaults.ssh_binary),
                sshpass_binary: var("SSHPASS_BINARY").unwrap_or(ssh_defaults.sshpass_binary),
                ..ssh_defaults
            },
            workspace_root: var("WORKSPACE_ROOT").unwrap_or(chain_defaults.workspace_root),
            workspace_image: var("WORKSPACE_IMAGE").unwrap_or(chain_defaults.workspace_image),
            port_range,
        })
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            workspace_root: self.workspace_root.clone(),
            workspace_image: self.workspace_image.clone(),
            port_range: self.port_range,
            step_timeout: self.step_timeout,
            script_timeout: self.script_timeout,
        }
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var: name,
            value,
            expected,
        }),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
