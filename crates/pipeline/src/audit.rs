//! Append-only audit notes.

use std::sync::Arc;

use chrono::Utc;
use rigger_core::entity::EntityRef;
use rigger_core::notes::{ensure_supported, format_note};

use crate::error::PipelineResult;
use crate::store::EntityStore;

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn EntityStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Append `message` as one line, prefixed with the current time when
    /// `timestamp` is set.
    ///
    /// Fails with `UnsupportedEntity` for entities without a notes field.
    pub async fn append(
        &self,
        entity: EntityRef,
        message: &str,
        timestamp: bool,
    ) -> PipelineResult<()> {
        ensure_supported(entity)?;
        let line = format_note(message, timestamp.then(Utc::now));
        self.store.append_note(entity, &line).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
