//! Script rendering.
//!
//! Every script the orchestrator can run is a variant of [`ScriptJob`] with
//! its own typed parameter struct, so a pipeline cannot forget a required
//! parameter. [`ScriptJob::from_template`] is the untyped entry point used by
//! the run-script API: a template id plus a JSON parameter map.

pub mod host;
pub mod workspace;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

pub use host::{FirewallParams, InstallPackagesParams};
pub use workspace::{
    ComposeConfigParams, ComposeProjectParams, CreateUserParams, FindFreePortParams,
    SetAccessParams,
};

/// Template identifiers accepted by [`ScriptJob::from_template`].
pub const TEMPLATE_IDS: &[&str] = &[
    "check-connection",
    "update-packages",
    "install-packages",
    "install-runtime",
    "update-firewall",
    "install-reverse-proxy",
    "create-user",
    "find-free-port",
    "write-compose-config",
    "start-compose",
    "set-access",
    "verify-workspace",
];

/// An inclusive TCP port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 29999,
        }
    }
}

impl PortRange {
    /// Parse `"20000-29999"`.
    pub fn parse(text: &str) -> Option<Self> {
        let (start, end) = text.split_once('-')?;
        let range = Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
        };
        (range.start != 0 && range.start <= range.end).then_some(range)
    }

    fn validate(&self, template: &str) -> Result<(), CoreError> {
        if self.start == 0 || self.start > self.end {
            return Err(CoreError::render(
                template,
                format!("invalid port range {}-{}", self.start, self.end),
            ));
        }
        Ok(())
    }
}

/// A closed set of renderable scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptJob {
    CheckConnection,
    UpdatePackages,
    InstallPackages(InstallPackagesParams),
    InstallRuntime,
    UpdateFirewall(FirewallParams),
    InstallReverseProxy,
    CreateUser(CreateUserParams),
    FindFreePort(FindFreePortParams),
    WriteComposeConfig(ComposeConfigParams),
    StartCompose(ComposeProjectParams),
    SetAccess(SetAccessParams),
    VerifyWorkspace(ComposeProjectParams),
}

impl ScriptJob {
    /// Build a job from a template id and a JSON parameter object.
    ///
    /// `Null` params are treated as `{}`, so templates whose parameters all
    /// have defaults can be requested without any.
    pub fn from_template(id: &str, params: Value) -> Result<Self, CoreError> {
        let job = match id {
            "check-connection" => Self::CheckConnection,
            "update-packages" => Self::UpdatePackages,
            "install-packages" => Self::InstallPackages(decode(id, params)?),
            "install-runtime" => Self::InstallRuntime,
            "update-firewall" => Self::UpdateFirewall(decode(id, params)?),
            "install-reverse-proxy" => Self::InstallReverseProxy,
            "create-user" => Self::CreateUser(decode(id, params)?),
            "find-free-port" => Self::FindFreePort(decode(id, params)?),
            "write-compose-config" => Self::WriteComposeConfig(decode(id, params)?),
            "start-compose" => Self::StartCompose(decode(id, params)?),
            "set-access" => Self::SetAccess(decode(id, params)?),
            "verify-workspace" => Self::VerifyWorkspace(decode(id, params)?),
            other => return Err(CoreError::TemplateNotFound(other.to_string())),
        };
        Ok(job)
    }

    pub fn template_id(&self) -> &'static str {
        match self {
            Self::CheckConnection => "check-connection",
            Self::UpdatePackages => "update-packages",
            Self::InstallPackages(_) => "install-packages",
            Self::InstallRuntime => "install-runtime",
            Self::UpdateFirewall(_) => "update-firewall",
            Self::InstallReverseProxy => "install-reverse-proxy",
            Self::CreateUser(_) => "create-user",
            Self::FindFreePort(_) => "find-free-port",
            Self::WriteComposeConfig(_) => "write-compose-config",
            Self::StartCompose(_) => "start-compose",
            Self::SetAccess(_) => "set-access",
            Self::VerifyWorkspace(_) => "verify-workspace",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::CheckConnection => "Check connection",
            Self::UpdatePackages => "Update packages",
            Self::InstallPackages(_) => "Install packages",
            Self::InstallRuntime => "Install container runtime",
            Self::UpdateFirewall(_) => "Configure firewall",
            Self::InstallReverseProxy => "Install reverse proxy",
            Self::CreateUser(_) => "Create workspace user",
            Self::FindFreePort(_) => "Find free port",
            Self::WriteComposeConfig(_) => "Write compose configuration",
            Self::StartCompose(_) => "Start workspace container",
            Self::SetAccess(_) => "Set workspace permissions",
            Self::VerifyWorkspace(_) => "Verify workspace",
        }
    }

    /// The parameter map, as stored on the execution record.
    pub fn params(&self) -> Value {
        let value = match self {
            Self::CheckConnection
            | Self::UpdatePackages
            | Self::InstallRuntime
            | Self::InstallReverseProxy => return Value::Object(Default::default()),
            Self::InstallPackages(p) => serde_json::to_value(p),
            Self::UpdateFirewall(p) => serde_json::to_value(p),
            Self::CreateUser(p) => serde_json::to_value(p),
            Self::FindFreePort(p) => serde_json::to_value(p),
            Self::WriteComposeConfig(p) => serde_json::to_value(p),
            Self::StartCompose(p) | Self::VerifyWorkspace(p) => serde_json::to_value(p),
            Self::SetAccess(p) => serde_json::to_value(p),
        };
        value.unwrap_or_default()
    }

    /// Render the final script body (without preamble).
    pub fn render(&self) -> Result<String, CoreError> {
        let id = self.template_id();
        match self {
            Self::CheckConnection => Ok(host::check_connection()),
            Self::UpdatePackages => Ok(host::update_packages()),
            Self::InstallPackages(p) => p.render(id),
            Self::InstallRuntime => Ok(host::install_runtime()),
            Self::UpdateFirewall(p) => p.render(id),
            Self::InstallReverseProxy => Ok(host::install_reverse_proxy()),
            Self::CreateUser(p) => p.render(id),
            Self::FindFreePort(p) => p.render(id),
            Self::WriteComposeConfig(p) => p.render(id),
            Self::StartCompose(p) => p.render_start(id),
            Self::SetAccess(p) => p.render(id),
            Self::VerifyWorkspace(p) => p.render_verify(id),
        }
    }
}

/// One unit of executable work: a job plus the name it is recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTask {
    pub job: ScriptJob,
    pub name: String,
}

impl ScriptTask {
    pub fn new(job: ScriptJob) -> Self {
        let name = job.display_name().to_string();
        Self { job, name }
    }

    pub fn named(job: ScriptJob, name: impl Into<String>) -> Self {
        Self {
            job,
            name: name.into(),
        }
    }
}

/// Render `id` with `params` in one go.
pub fn render_template(id: &str, params: Value) -> Result<String, CoreError> {
    ScriptJob::from_template(id, params)?.render()
}

fn decode<T: DeserializeOwned>(template: &str, params: Value) -> Result<T, CoreError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| CoreError::render(template, e.to_string()))
}

mod validate {
    use std::sync::LazyLock;

    use regex::Regex;

    use crate::error::CoreError;

    static USERNAME: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));
    static PACKAGE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9.+:-]*$").expect("valid regex"));
    static PROJECT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid regex"));
    static IMAGE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/:@-]*$").expect("valid regex"));
    static PATH: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^/[a-zA-Z0-9._/-]*$").expect("valid regex"));

    fn check(re: &Regex, template: &str, field: &str, value: &str) -> Result<(), CoreError> {
        if re.is_match(value) {
            Ok(())
        } else {
            Err(CoreError::render(
                template,
                format!("invalid {field} '{value}'"),
            ))
        }
    }

    pub fn username(template: &str, value: &str) -> Result<(), CoreError> {
        check(&USERNAME, template, "username", value)
    }

    pub fn package_name(template: &str, value: &str) -> Result<(), CoreError> {
        check(&PACKAGE, template, "package name", value)
    }

    pub fn project_name(template: &str, value: &str) -> Result<(), CoreError> {
        check(&PROJECT, template, "project name", value)
    }

    pub fn image(template: &str, value: &str) -> Result<(), CoreError> {
        check(&IMAGE, template, "image", value)
    }

    pub fn absolute_path(template: &str, value: &str) -> Result<(), CoreError> {
        if value.contains("..") {
            return Err(CoreError::render(
                template,
                format!("invalid path '{value}'"),
            ));
        }
        check(&PATH, template, "path", value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::extractor::{extract_first, Sentinel, FREE_PORT};

    fn compose_params() -> ComposeConfigParams {
        ComposeConfigParams {
            workdir: "/srv/workspaces/ws-7".into(),
            project: "ws-7".into(),
            image: "ghcr.io/acme/workspace:1.2".into(),
            username: "ws-7".into(),
            host_port: 20005,
            container_port: 8080,
        }
    }

    #[test]
    fn every_template_id_resolves() {
        let params = json!({
            "username": "ws-1",
            "workdir": "/srv/workspaces/ws-1",
            "project": "ws-1",
            "image": "nginx:latest",
            "host_port": 20001,
        });
        for id in TEMPLATE_IDS {
            let job = ScriptJob::from_template(id, params.clone())
                .unwrap_or_else(|e| panic!("{id}: {e}"));
            assert_eq!(job.template_id(), *id);
            job.render().unwrap_or_else(|e| panic!("{id}: {e}"));
        }
    }

    #[test]
    fn unknown_template_is_not_found() {
        assert_matches!(
            render_template("format-disk", Value::Null),
            Err(CoreError::TemplateNotFound(id)) if id == "format-disk"
        );
    }

    #[test]
    fn missing_required_param_is_render_error() {
        let err = render_template("create-user", json!({"username": "ws-1"})).unwrap_err();
        assert_matches!(&err, CoreError::Render { template, .. } if template == "create-user");
        assert!(err.to_string().contains("workdir"));
    }

    #[test]
    fn null_params_fall_back_to_defaults() {
        let script = render_template("install-packages", Value::Null).expect("render");
        assert!(script.starts_with("apt-get install -y --no-install-recommends"));
        assert!(script.contains(" curl "));
    }

    #[test]
    fn empty_package_list_is_rejected() {
        let job = ScriptJob::InstallPackages(InstallPackagesParams { packages: vec![] });
        assert_matches!(job.render(), Err(CoreError::Render { .. }));
    }

    #[test]
    fn shell_metacharacters_in_params_are_rejected() {
        let job = ScriptJob::InstallPackages(InstallPackagesParams {
            packages: vec!["curl; rm -rf /".into()],
        });
        assert_matches!(job.render(), Err(CoreError::Render { .. }));

        let mut params = compose_params();
        params.workdir = "/srv/../etc".into();
        assert_matches!(
            ScriptJob::WriteComposeConfig(params).render(),
            Err(CoreError::Render { .. })
        );
    }

    #[test]
    fn compose_config_embeds_port_mapping() {
        let script = ScriptJob::WriteComposeConfig(compose_params())
            .render()
            .expect("render");
        assert!(script.contains("cat > '/srv/workspaces/ws-7'/compose.yaml <<'RIGGER_COMPOSE'"));
        assert!(script.contains("- \"20005:8080\""));
        assert!(script.contains("container_name: ws-7"));
        assert!(script.trim_end().ends_with("echo \"wrote ws-7 compose file\""));
    }

    #[test]
    fn start_compose_wraps_listing_in_markers() {
        let script = ScriptJob::StartCompose(ComposeProjectParams {
            workdir: "/srv/workspaces/ws-7".into(),
            project: "ws-7".into(),
        })
        .render()
        .expect("render");
        let start = script.find("__DOCKER_PS_START__").expect("start marker");
        let ps = script.find("ps --format json").expect("listing");
        let end = script.find("__DOCKER_PS_END__").expect("end marker");
        assert!(start < ps && ps < end);
    }

    #[test]
    fn verify_uses_go_template_braces() {
        let script = ScriptJob::VerifyWorkspace(ComposeProjectParams {
            workdir: "/srv/workspaces/ws-7".into(),
            project: "ws-7".into(),
        })
        .render()
        .expect("render");
        assert!(script.contains("'{{.State.Running}}' ws-7"));
    }

    #[test]
    fn firewall_opens_workspace_range() {
        let job = ScriptJob::from_template(
            "update-firewall",
            json!({"workspace_ports": {"start": 21000, "end": 21999}}),
        )
        .expect("job");
        let script = job.render().expect("render");
        assert!(script.contains("ufw allow 22/tcp"));
        assert!(script.contains("ufw allow 21000:21999/tcp"));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let job = ScriptJob::FindFreePort(FindFreePortParams {
            range: PortRange {
                start: 30000,
                end: 20000,
            },
        });
        assert_matches!(job.render(), Err(CoreError::Render { .. }));
    }

    #[test]
    fn port_range_parse() {
        assert_eq!(
            PortRange::parse("20000-29999"),
            Some(PortRange {
                start: 20000,
                end: 29999
            })
        );
        assert_eq!(PortRange::parse("9-1"), None);
        assert_eq!(PortRange::parse("abc"), None);
    }

    #[test]
    fn params_round_trip_through_from_template() {
        let job = ScriptJob::WriteComposeConfig(compose_params());
        let rebuilt = ScriptJob::from_template(job.template_id(), job.params()).expect("job");
        assert_eq!(rebuilt, job);
        assert_eq!(ScriptJob::InstallRuntime.params(), json!({}));
    }

    #[test]
    fn task_name_defaults_to_display_name() {
        assert_eq!(ScriptTask::new(ScriptJob::UpdatePackages).name, "Update packages");
        assert_eq!(
            ScriptTask::named(ScriptJob::UpdatePackages, "Update packages on web-1").name,
            "Update packages on web-1"
        );
    }

    #[tokio::test]
    async fn free_port_script_emits_marked_payload() {
        use crate::scripting::executor::{ScriptExecutor, ScriptInput};
        use crate::scripting::shell::ShellExecutor;

        // A fake `ss` that reports every port as free keeps this independent
        // of the machine running the test.
        let bin = tempfile::tempdir().expect("temp dir");
        let ss = bin.path().join("ss");
        std::fs::write(&ss, "#!/bin/sh\nexit 0\n").expect("write fake ss");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&ss, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        let path = format!(
            "{}:{}",
            bin.path().display(),
            std::env::var("PATH").unwrap_or_default()
        );

        let script = ScriptJob::FindFreePort(FindFreePortParams {
            range: PortRange {
                start: 20005,
                end: 20010,
            },
        })
        .render()
        .expect("render");
        let output = ShellExecutor::default()
            .execute(ScriptInput::new(script).with_env("PATH", path))
            .await
            .expect("execute");
        assert!(output.successful, "{}", output.error_output);

        #[derive(Deserialize)]
        struct Port {
            port: u16,
        }
        let port: Option<Port> = extract_first(&output.output, &Sentinel::named(FREE_PORT));
        assert_eq!(port.map(|p| p.port), Some(20005));
    }
}
