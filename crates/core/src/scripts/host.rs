//! Host provisioning scripts.
//!
//! These run against a freshly registered machine, in pipeline order:
//! connection check, package refresh, base packages, container runtime,
//! firewall, reverse proxy.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

use super::{validate, PortRange};

pub(super) fn check_connection() -> String {
    r#"echo "Connected to $(hostname)"
uname -srm
if [ -r /etc/os-release ]; then
  . /etc/os-release
  echo "os=${ID:-unknown} version=${VERSION_ID:-unknown}"
fi
df -h / | tail -n 1
"#
    .to_string()
}

pub(super) fn update_packages() -> String {
    "apt-get update -y
apt-get -y -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold upgrade
"
    .to_string()
}

/// Parameters of `install-packages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPackagesParams {
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
}

impl Default for InstallPackagesParams {
    fn default() -> Self {
        Self {
            packages: default_packages(),
        }
    }
}

fn default_packages() -> Vec<String> {
    ["ca-certificates", "curl", "gnupg", "git", "jq", "ufw"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl InstallPackagesParams {
    pub(super) fn render(&self, template: &str) -> Result<String, CoreError> {
        if self.packages.is_empty() {
            return Err(CoreError::render(template, "packages must not be empty"));
        }
        for package in &self.packages {
            validate::package_name(template, package)?;
        }
        Ok(format!(
            "apt-get install -y --no-install-recommends {}\n",
            self.packages.join(" ")
        ))
    }
}

pub(super) fn install_runtime() -> String {
    r#"if ! command -v docker >/dev/null 2>&1; then
  install -m 0755 -d /etc/apt/keyrings
  . /etc/os-release
  curl -fsSL "https://download.docker.com/linux/${ID}/gpg" -o /etc/apt/keyrings/docker.asc
  chmod a+r /etc/apt/keyrings/docker.asc
  echo "deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.asc] https://download.docker.com/linux/${ID} ${VERSION_CODENAME} stable" \
    > /etc/apt/sources.list.d/docker.list
  apt-get update -y
  apt-get install -y docker-ce docker-ce-cli containerd.io docker-compose-plugin
fi
systemctl enable --now docker
docker compose version
"#
    .to_string()
}

/// Parameters of `update-firewall`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallParams {
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub workspace_ports: PortRange,
}

impl Default for FirewallParams {
    fn default() -> Self {
        Self {
            ssh_port: default_ssh_port(),
            workspace_ports: PortRange::default(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

impl FirewallParams {
    pub(super) fn render(&self, template: &str) -> Result<String, CoreError> {
        self.workspace_ports.validate(template)?;
        Ok(format!(
            "ufw allow {ssh}/tcp
ufw allow 80/tcp
ufw allow 443/tcp
ufw allow {start}:{end}/tcp
ufw --force enable
ufw status verbose
",
            ssh = self.ssh_port,
            start = self.workspace_ports.start,
            end = self.workspace_ports.end,
        ))
    }
}

pub(super) fn install_reverse_proxy() -> String {
    "apt-get install -y --no-install-recommends nginx
systemctl enable --now nginx
nginx -t
"
    .to_string()
}
