use crate::entity::{EntityKind, EntityRef};
use crate::types::DbId;

/// Domain errors raised by the core crate.
///
/// Subprocess failures are not represented here: a non-zero exit is a
/// normal [`ExecutionResult`](crate::scripting::executor::ExecutionResult)
/// and spawn/timeout problems are
/// [`ScriptError`](crate::scripting::executor::ScriptError)s.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Script template not found: {0}")]
    TemplateNotFound(String),

    #[error("Failed to render script '{template}': {message}")]
    Render { template: String, message: String },

    #[error(
        "Metadata key '{key}' not found on {entity} (available: [{keys}]) at {caller}",
        keys = .available.join(", ")
    )]
    MetadataKeyNotFound {
        key: String,
        entity: EntityRef,
        available: Vec<String>,
        caller: String,
    },

    #[error("Entity kind '{0}' does not support notes")]
    UnsupportedEntity(EntityKind),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a [`CoreError::Render`] against a named template.
    pub fn render(template: &str, message: impl Into<String>) -> Self {
        Self::Render {
            template: template.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
