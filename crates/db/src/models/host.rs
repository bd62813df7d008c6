//! Models for the `hosts` table.

use rigger_core::scripting::target::{Credential, RemoteHost};
use rigger_core::status::{HostStatus, StatusId};
use rigger_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Default SSH port for hosts registered without one.
pub const DEFAULT_SSH_PORT: i32 = 22;

/// A machine managed by the provisioning pipelines.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Host {
    pub id: DbId,
    pub name: String,
    pub address: String,
    pub ssh_port: i32,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub identity_file: Option<String>,
    pub status_id: StatusId,
    /// Joined from `host_statuses.name`.
    pub status_name: String,
    pub metadata: serde_json::Value,
    pub metadata_version: i64,
    pub notes: Option<String>,
    pub claimed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Host {
    pub fn status(&self) -> Option<HostStatus> {
        HostStatus::from_id(self.status_id)
    }

    /// Connection details for the execution engine.
    ///
    /// A stored password wins over an identity file; with neither, the local
    /// SSH agent is used.
    pub fn remote_target(&self) -> RemoteHost {
        let credential = match (&self.password, &self.identity_file) {
            (Some(password), _) => Credential::Password(password.clone()),
            (None, Some(path)) => Credential::IdentityFile(path.clone()),
            (None, None) => Credential::Agent,
        };
        RemoteHost {
            address: self.address.clone(),
            port: u16::try_from(self.ssh_port).unwrap_or(DEFAULT_SSH_PORT as u16),
            username: self.username.clone(),
            credential,
        }
    }
}

/// DTO for registering a host. New hosts start `pending` and are picked up
/// by the provisioning worker.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateHost {
    pub name: String,
    pub address: String,
    pub ssh_port: Option<i32>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn host(password: Option<&str>, identity_file: Option<&str>) -> Host {
        Host {
            id: 1,
            name: "web-1".into(),
            address: "10.0.0.5".into(),
            ssh_port: 2222,
            username: "root".into(),
            password: password.map(String::from),
            identity_file: identity_file.map(String::from),
            status_id: HostStatus::Pending.id(),
            status_name: "pending".into(),
            metadata: serde_json::json!({}),
            metadata_version: 0,
            notes: None,
            claimed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn credential_preference() {
        assert_eq!(
            host(Some("pw"), Some("/k")).remote_target().credential,
            Credential::Password("pw".into())
        );
        assert_eq!(
            host(None, Some("/k")).remote_target().credential,
            Credential::IdentityFile("/k".into())
        );
        assert_eq!(host(None, None).remote_target().credential, Credential::Agent);
        assert_eq!(host(None, None).remote_target().port, 2222);
    }

    #[test]
    fn password_is_never_serialized() {
        let value = serde_json::to_value(host(Some("hunter2"), None)).expect("serialize");
        assert!(value.get("password").is_none());
        assert_eq!(value["status_name"], "pending");
    }
}
