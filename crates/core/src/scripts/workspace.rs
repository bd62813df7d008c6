//! Workspace provisioning scripts.
//!
//! A workspace is one compose project per work attempt, owned by its own
//! system user, living under a directory on an already provisioned host.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::extractor::{DOCKER_PS, FREE_PORT};
use crate::scripting::shell::shell_quote;

use super::{validate, PortRange};

/// Parameters of `create-user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub username: String,
    pub workdir: String,
}

impl CreateUserParams {
    pub(super) fn render(&self, template: &str) -> Result<String, CoreError> {
        validate::username(template, &self.username)?;
        validate::absolute_path(template, &self.workdir)?;
        let user = &self.username;
        let dir = shell_quote(&self.workdir);
        Ok(format!(
            "if ! id -u {user} >/dev/null 2>&1; then
  useradd --create-home --shell /bin/bash {user}
fi
mkdir -p {dir}
echo \"user {user} ready\"
"
        ))
    }
}

/// Parameters of `find-free-port`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindFreePortParams {
    #[serde(default)]
    pub range: PortRange,
}

impl FindFreePortParams {
    pub(super) fn render(&self, template: &str) -> Result<String, CoreError> {
        self.range.validate(template)?;
        let (start, end) = (self.range.start, self.range.end);
        Ok(format!(
            r#"for port in $(seq {start} {end}); do
  if [ -z "$(ss -ltnH "sport = :$port")" ]; then
    echo "__{FREE_PORT}_START__"
    echo "{{\"port\": $port}}"
    echo "__{FREE_PORT}_END__"
    exit 0
  fi
done
echo "No free port in {start}-{end}" >&2
exit 1
"#
        ))
    }
}

/// Parameters of `write-compose-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeConfigParams {
    pub workdir: String,
    pub project: String,
    pub image: String,
    pub username: String,
    pub host_port: u16,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

fn default_container_port() -> u16 {
    8080
}

impl ComposeConfigParams {
    pub(super) fn render(&self, template: &str) -> Result<String, CoreError> {
        validate::absolute_path(template, &self.workdir)?;
        validate::project_name(template, &self.project)?;
        validate::image(template, &self.image)?;
        validate::username(template, &self.username)?;
        if self.host_port == 0 {
            return Err(CoreError::render(template, "host_port must be non-zero"));
        }
        let dir = shell_quote(&self.workdir);
        Ok(format!(
            "mkdir -p {dir}/data
cat > {dir}/compose.yaml <<'RIGGER_COMPOSE'
services:
  workspace:
    image: {image}
    container_name: {project}
    restart: unless-stopped
    environment:
      WORKSPACE_USER: {username}
    ports:
      - \"{host_port}:{container_port}\"
    volumes:
      - ./data:/home/{username}/data
RIGGER_COMPOSE
echo \"wrote {project} compose file\"
",
            image = self.image,
            project = self.project,
            username = self.username,
            host_port = self.host_port,
            container_port = self.container_port,
        ))
    }
}

/// Parameters of `start-compose` and `verify-workspace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeProjectParams {
    pub workdir: String,
    pub project: String,
}

impl ComposeProjectParams {
    fn check(&self, template: &str) -> Result<(), CoreError> {
        validate::absolute_path(template, &self.workdir)?;
        validate::project_name(template, &self.project)
    }

    pub(super) fn render_start(&self, template: &str) -> Result<String, CoreError> {
        self.check(template)?;
        Ok(format!(
            "cd {dir}
docker compose -p {project} up -d --pull missing
{listing}",
            dir = shell_quote(&self.workdir),
            project = self.project,
            listing = self.listing(),
        ))
    }

    pub(super) fn render_verify(&self, template: &str) -> Result<String, CoreError> {
        self.check(template)?;
        Ok(format!(
            "running=$(docker inspect -f '{{{{.State.Running}}}}' {project})
if [ \"$running\" != \"true\" ]; then
  echo \"container {project} is not running\" >&2
  exit 1
fi
cd {dir}
{listing}",
            dir = shell_quote(&self.workdir),
            project = self.project,
            listing = self.listing(),
        ))
    }

    fn listing(&self) -> String {
        format!(
            "echo \"__{DOCKER_PS}_START__\"
docker compose -p {project} ps --format json
echo \"__{DOCKER_PS}_END__\"
",
            project = self.project,
        )
    }
}

/// Parameters of `set-access`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAccessParams {
    pub username: String,
    pub workdir: String,
}

impl SetAccessParams {
    pub(super) fn render(&self, template: &str) -> Result<String, CoreError> {
        validate::username(template, &self.username)?;
        validate::absolute_path(template, &self.workdir)?;
        let dir = shell_quote(&self.workdir);
        Ok(format!(
            "chown -R {user}:{user} {dir}
chmod 750 {dir}
",
            user = self.username,
        ))
    }
}
