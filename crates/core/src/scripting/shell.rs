//! Bash script executor.
//!
//! Every script is prefixed with [`PREAMBLE`] before it runs. Local scripts
//! are either staged in a temp file (`bash <file>`) or streamed over stdin
//! (`bash -s`). Remote scripts are always streamed over stdin to `bash -s`
//! through `ssh`, so no file is ever written on the remote side.

use std::io::Write;

use async_trait::async_trait;
use tokio::process::Command;

use super::executor::{Delivery, ExecutionResult, ScriptError, ScriptExecutor, ScriptInput};
use super::subprocess;
use super::target::{Credential, ExecutionTarget, RemoteHost};

/// Prepended to every script: fail fast, never prompt.
pub const PREAMBLE: &str = "set -euo pipefail\n\
export DEBIAN_FRONTEND=noninteractive\n\
export NEEDRESTART_MODE=a\n\
export NEEDRESTART_SUSPEND=1\n";

/// `PREAMBLE` followed by `body`.
pub fn wrap_script(body: &str) -> String {
    let mut script = String::with_capacity(PREAMBLE.len() + body.len() + 1);
    script.push_str(PREAMBLE);
    script.push_str(body);
    if !body.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Single-quote `value` for safe interpolation into a bash command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Binaries and options used for remote execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub ssh_binary: String,
    pub sshpass_binary: String,
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Build the `ssh` (or `sshpass -e ssh`) invocation that runs `bash -s` on
/// `host`.
pub fn ssh_invocation(settings: &SshSettings, host: &RemoteHost) -> Invocation {
    let mut ssh_args = vec![
        "-p".to_string(),
        host.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", settings.connect_timeout_secs),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ];

    match &host.credential {
        Credential::Password(password) => {
            ssh_args.push(host.destination());
            ssh_args.extend(["bash".to_string(), "-s".to_string()]);
            let mut args = vec!["-e".to_string(), settings.ssh_binary.clone()];
            args.extend(ssh_args);
            Invocation {
                program: settings.sshpass_binary.clone(),
                args,
                env: vec![("SSHPASS".to_string(), password.clone())],
            }
        }
        Credential::IdentityFile(path) => {
            ssh_args.extend(["-i".to_string(), path.clone()]);
            ssh_args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
            ssh_args.push(host.destination());
            ssh_args.extend(["bash".to_string(), "-s".to_string()]);
            Invocation {
                program: settings.ssh_binary.clone(),
                args: ssh_args,
                env: Vec::new(),
            }
        }
        Credential::Agent => {
            ssh_args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
            ssh_args.push(host.destination());
            ssh_args.extend(["bash".to_string(), "-s".to_string()]);
            Invocation {
                program: settings.ssh_binary.clone(),
                args: ssh_args,
                env: Vec::new(),
            }
        }
    }
}

/// Script text for a remote run. Environment variables and the working
/// directory cannot be set on the local `ssh` process, so they become
/// `export` and `cd` lines after the preamble.
pub fn remote_script(input: &ScriptInput) -> String {
    let mut body = String::new();
    for (key, value) in &input.env_vars {
        body.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    if let Some(dir) = &input.working_directory {
        body.push_str(&format!("cd {}\n", shell_quote(dir)));
    }
    body.push_str(&input.script);
    wrap_script(&body)
}

/// Production [`ScriptExecutor`] backed by `bash`.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    ssh: SshSettings,
}

impl ShellExecutor {
    pub fn new(ssh: SshSettings) -> Self {
        Self { ssh }
    }

    /// Stage the wrapped script in a temp file and run `bash <file>`.
    ///
    /// The file is removed whether the script succeeds, fails, or times out.
    pub async fn execute_file(&self, input: &ScriptInput) -> Result<ExecutionResult, ScriptError> {
        let mut file = tempfile::Builder::new()
            .prefix("rigger-")
            .suffix(".sh")
            .tempfile()?;
        file.write_all(wrap_script(&input.script).as_bytes())?;
        file.flush()?;

        let mut cmd = local_command(input);
        cmd.arg(file.path());
        let result = subprocess::run_command(&mut cmd, None, input.timeout).await;

        if let Err(e) = file.close() {
            tracing::warn!(error = %e, "Failed to remove staged script file");
        }
        result
    }

    /// Stream the wrapped script over stdin, to a local `bash -s` or to a
    /// remote one through `ssh`.
    pub async fn execute_via_stdin(
        &self,
        input: &ScriptInput,
    ) -> Result<ExecutionResult, ScriptError> {
        match &input.target {
            ExecutionTarget::Local => {
                let mut cmd = local_command(input);
                cmd.arg("-s");
                let payload = wrap_script(&input.script).into_bytes();
                subprocess::run_command(&mut cmd, Some(payload), input.timeout).await
            }
            ExecutionTarget::Remote(host) => {
                tracing::debug!(
                    destination = %host.destination(),
                    port = host.port,
                    "Streaming script over ssh",
                );
                let mut cmd = ssh_invocation(&self.ssh, host).command();
                let payload = remote_script(input).into_bytes();
                subprocess::run_command(&mut cmd, Some(payload), input.timeout).await
            }
        }
    }
}

#[async_trait]
impl ScriptExecutor for ShellExecutor {
    async fn execute(&self, input: ScriptInput) -> Result<ExecutionResult, ScriptError> {
        match (&input.target, input.delivery) {
            (ExecutionTarget::Local, Delivery::TempFile) => self.execute_file(&input).await,
            _ => self.execute_via_stdin(&input).await,
        }
    }
}

fn local_command(input: &ScriptInput) -> Command {
    let mut cmd = Command::new("bash");
    for (key, value) in &input.env_vars {
        cmd.env(key, value);
    }
    if let Some(ref dir) = input.working_directory {
        cmd.current_dir(dir);
    }
    cmd
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
