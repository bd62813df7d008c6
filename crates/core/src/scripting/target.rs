//! Where a script runs.

use std::fmt;

/// Execution target handed to the engine alongside the script.
///
/// Connection details never end up in the rendered script text; the engine
/// builds the remote invocation itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionTarget {
    /// Run `bash` on the machine the engine runs on.
    #[default]
    Local,
    /// Stream the script to `bash -s` on another machine over SSH.
    Remote(RemoteHost),
}

/// How the engine authenticates against a remote host.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password auth, passed to `sshpass` through the `SSHPASS` variable.
    Password(String),
    /// Private key file passed with `-i`.
    IdentityFile(String),
    /// Whatever the local SSH agent offers.
    Agent,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password([REDACTED])"),
            Self::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Connection details of a remote machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl RemoteHost {
    /// `user@address`, as passed to `ssh`.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}
