//! Structured payload extraction from script stdout.
//!
//! Scripts embed machine-readable data in otherwise free-form output by
//! wrapping it in sentinel lines:
//!
//! ```text
//! __DOCKER_PS_START__
//! {"ID":"abc","Name":"n1","Publishers":[{"PublishedPort":8080}]}
//! __DOCKER_PS_END__
//! ```
//!
//! Every non-blank line between the markers is decoded on its own.
//! Malformed lines are skipped, never fatal. The marker format is a contract
//! with the script templates and must not change.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Marker name for `docker compose ps --format json` listings.
pub const DOCKER_PS: &str = "DOCKER_PS";

/// Marker name for the free-port probe result.
pub const FREE_PORT: &str = "FREE_PORT";

/// A start/end marker pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    start: String,
    end: String,
}

impl Sentinel {
    /// `Sentinel::named("DOCKER_PS")` matches `__DOCKER_PS_START__` ... `__DOCKER_PS_END__`.
    pub fn named(name: &str) -> Self {
        Self {
            start: format!("__{name}_START__"),
            end: format!("__{name}_END__"),
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::named("MARKER")
    }
}

/// Decode every JSON line inside every marked region of `stdout`.
///
/// A region that is never closed runs to the end of the output.
pub fn extract_json_lines(stdout: &str, sentinel: &Sentinel) -> Vec<Value> {
    let mut values = Vec::new();
    let mut inside = false;

    for line in stdout.lines() {
        let line = line.trim();
        if line == sentinel.start {
            inside = true;
            continue;
        }
        if line == sentinel.end {
            inside = false;
            continue;
        }
        if !inside || line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => values.push(value),
            Err(e) => {
                tracing::debug!(error = %e, marker = %sentinel.start, "Skipping malformed payload line");
            }
        }
    }

    values
}

/// Decode the first marked line that deserializes into `T`.
pub fn extract_first<T: DeserializeOwned>(stdout: &str, sentinel: &Sentinel) -> Option<T> {
    extract_json_lines(stdout, sentinel)
        .into_iter()
        .find_map(|value| serde_json::from_value(value).ok())
}

// ---------------------------------------------------------------------------
// Container listings
// ---------------------------------------------------------------------------

/// One published port mapping of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    #[serde(default, alias = "URL")]
    pub url: Option<String>,
    #[serde(default, alias = "TargetPort")]
    pub target_port: Option<u16>,
    #[serde(default, alias = "PublishedPort")]
    pub published_port: Option<u16>,
    #[serde(default, alias = "Protocol")]
    pub protocol: Option<String>,
}

/// One container as listed by `docker compose ps --format json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "State")]
    pub state: Option<String>,
    #[serde(default, alias = "Publishers", deserialize_with = "null_as_empty")]
    pub publishers: Vec<Publisher>,
}

impl ContainerInfo {
    /// The first non-zero published host port.
    pub fn published_port(&self) -> Option<u16> {
        self.publishers
            .iter()
            .filter_map(|p| p.published_port)
            .find(|port| *port != 0)
    }
}

/// Extract the container listing wrapped in `DOCKER_PS` markers.
///
/// Older compose releases print a single JSON array instead of one object
/// per line; both shapes are accepted.
pub fn extract_containers(stdout: &str) -> Vec<ContainerInfo> {
    extract_json_lines(stdout, &Sentinel::named(DOCKER_PS))
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items,
            other => vec![other],
        })
        .filter_map(|value| serde_json::from_value::<ContainerInfo>(value).ok())
        .collect()
}

/// The published port of the primary (first listed) container.
pub fn primary_published_port(containers: &[ContainerInfo]) -> Option<u16> {
    containers.first().and_then(ContainerInfo::published_port)
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
