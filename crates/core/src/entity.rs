//! References to the long-lived entities that own metadata bags and notes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DbId;

/// The kinds of entity the orchestrator tracks state on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A provisioning target machine.
    Host,
    /// One workspace provisioning session for a (user, task) pair.
    WorkAttempt,
    /// A single script execution row.
    ExecutionRecord,
}

impl EntityKind {
    /// Stable lowercase name used in logs, notes and event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::WorkAttempt => "work_attempt",
            Self::ExecutionRecord => "execution_record",
        }
    }

    /// Whether this entity declares an append-only notes field.
    pub fn supports_notes(self) -> bool {
        matches!(self, Self::Host | Self::WorkAttempt)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed pointer to one entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: DbId,
}

impl EntityRef {
    pub fn host(id: DbId) -> Self {
        Self {
            kind: EntityKind::Host,
            id,
        }
    }

    pub fn attempt(id: DbId) -> Self {
        Self {
            kind: EntityKind::WorkAttempt,
            id,
        }
    }

    pub fn execution(id: DbId) -> Self {
        Self {
            kind: EntityKind::ExecutionRecord,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_id() {
        assert_eq!(EntityRef::host(7).to_string(), "host#7");
        assert_eq!(EntityRef::attempt(3).to_string(), "work_attempt#3");
    }

    #[test]
    fn only_hosts_and_attempts_carry_notes() {
        assert!(EntityKind::Host.supports_notes());
        assert!(EntityKind::WorkAttempt.supports_notes());
        assert!(!EntityKind::ExecutionRecord.supports_notes());
    }
}
