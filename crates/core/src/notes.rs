//! Append-only audit notes.
//!
//! Hosts and work attempts carry a free-text `notes` column. Each entry is
//! one line, optionally prefixed with a UTC timestamp. Lines are only ever
//! appended; nothing edits or truncates the log.

use crate::entity::EntityRef;
use crate::error::CoreError;
use crate::types::Timestamp;

/// Timestamp layout used for note prefixes.
const NOTE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fail fast when the entity has no notes field.
pub fn ensure_supported(entity: EntityRef) -> Result<(), CoreError> {
    if entity.kind.supports_notes() {
        Ok(())
    } else {
        Err(CoreError::UnsupportedEntity(entity.kind))
    }
}

/// Render a single note line.
///
/// Embedded newlines are flattened so one append is always one line.
pub fn format_note(message: &str, at: Option<Timestamp>) -> String {
    let message = message.trim().replace(['\r', '\n'], " ");
    match at {
        Some(at) => format!("[{}] {message}", at.format(NOTE_TIME_FORMAT)),
        None => message,
    }
}

/// Append `line` to the existing log text.
pub fn append_line(existing: Option<&str>, line: &str) -> String {
    match existing {
        Some(log) if !log.is_empty() => {
            let mut out = String::with_capacity(log.len() + line.len() + 1);
            out.push_str(log.trim_end_matches('\n'));
            out.push('\n');
            out.push_str(line);
            out
        }
        _ => line.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
