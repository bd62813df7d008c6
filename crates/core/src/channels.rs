//! Change-channel naming.
//!
//! Observers subscribe per entity instance; these keys and event names must
//! match what the UI listens on.

use crate::entity::{EntityKind, EntityRef};

/// Workflow projection changed (step started, completed, or metadata merged).
pub const EVENT_WORKFLOW_UPDATED: &str = "workflow.updated";

/// The chain finished all of its steps.
pub const EVENT_WORKFLOW_COMPLETED: &str = "workflow.completed";

/// The chain halted on a failed step.
pub const EVENT_WORKFLOW_FAILED: &str = "workflow.failed";

/// Channel key for one entity, e.g. `host-updates.12`.
pub fn channel_key(entity: EntityRef) -> String {
    let prefix = match entity.kind {
        EntityKind::Host => "host-updates",
        EntityKind::WorkAttempt => "workspace-updates",
        EntityKind::ExecutionRecord => "execution-updates",
    };
    format!("{prefix}.{}", entity.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_entity() {
        assert_eq!(channel_key(EntityRef::host(12)), "host-updates.12");
        assert_eq!(channel_key(EntityRef::attempt(5)), "workspace-updates.5");
        assert_eq!(channel_key(EntityRef::execution(9)), "execution-updates.9");
    }
}
