//! Workflow projection.
//!
//! A workflow is never persisted as its own row. It is recomputed on demand
//! from the owning entity's metadata bag: the `current_step` pointer plus
//! the `step_history` map, interpreted against a static list of
//! [`StepDefinition`]s. Projection is pure; it never writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::{MetadataBag, KEY_CURRENT_STEP, KEY_STEP_HISTORY, KEY_WORKFLOW};
use crate::types::Timestamp;

/// Marker stored in `current_step` once every step has completed.
pub const CURRENT_STEP_COMPLETED: &str = "completed";

/// Marker stored in `current_step` once the chain has halted.
pub const CURRENT_STEP_FAILED: &str = "failed";

// ---------------------------------------------------------------------------
// Static step descriptors
// ---------------------------------------------------------------------------

/// Static descriptor of one step, known when the chain is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepDefinition {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    /// Rough duration shown to observers before the step finishes.
    pub estimated_secs: u32,
}

// ---------------------------------------------------------------------------
// Persisted step history
// ---------------------------------------------------------------------------

/// Per-step status: `not_started -> in_progress -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// One entry of `step_history`, as stored in the metadata bag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Decoded `current_step` pointer.
///
/// The stored value is a plain string for observer compatibility; the two
/// terminal markers are lifted into their own variants here so nothing else
/// has to compare against magic strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentStep {
    Idle,
    Step(String),
    Completed,
    Failed,
}

impl CurrentStep {
    pub fn from_bag(bag: &MetadataBag) -> Self {
        match bag.get_opt(KEY_CURRENT_STEP).and_then(Value::as_str) {
            None | Some("") => Self::Idle,
            Some(CURRENT_STEP_COMPLETED) => Self::Completed,
            Some(CURRENT_STEP_FAILED) => Self::Failed,
            Some(step) => Self::Step(step.to_string()),
        }
    }

    /// The string written back into the bag, or `None` for idle.
    pub fn as_stored(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Step(step) => Some(step),
            Self::Completed => Some(CURRENT_STEP_COMPLETED),
            Self::Failed => Some(CURRENT_STEP_FAILED),
        }
    }
}

/// Decode `step_history`. Entries that do not decode are skipped.
pub fn step_history(bag: &MetadataBag) -> BTreeMap<String, StepRecord> {
    let Some(Value::Object(entries)) = bag.get_opt(KEY_STEP_HISTORY) else {
        return BTreeMap::new();
    };

    entries
        .iter()
        .filter_map(|(step, raw)| match serde_json::from_value(raw.clone()) {
            Ok(record) => Some((step.clone(), record)),
            Err(e) => {
                tracing::warn!(
                    entity = %bag.entity(),
                    step = %step,
                    error = %e,
                    "Skipping malformed step history entry",
                );
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Overall workflow status as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Explicit workflow state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    Running {
        step: Option<String>,
    },
    Completed,
    Failed {
        step: Option<String>,
        reason: Option<String>,
    },
}

/// One step as shown to observers: its static definition plus history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    #[serde(flatten)]
    pub definition: StepDefinition,
    #[serde(flatten)]
    pub record: StepRecord,
}

/// The projected workflow for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowState {
    pub workflow: Option<String>,
    pub status: OverallStatus,
    pub phase: WorkflowPhase,
    pub current_step: Option<String>,
    pub steps: Vec<StepView>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub percentage: u8,
}

impl WorkflowState {
    /// The step entry for `step_id`, if it is one of the defined steps.
    pub fn step(&self, step_id: &str) -> Option<&StepView> {
        self.steps.iter().find(|s| s.definition.id == step_id)
    }
}

/// Project the workflow state of `bag` against `definitions`.
pub fn project(definitions: &[StepDefinition], bag: &MetadataBag) -> WorkflowState {
    let history = step_history(bag);
    let current = CurrentStep::from_bag(bag);

    let steps: Vec<StepView> = definitions
        .iter()
        .map(|definition| StepView {
            definition: *definition,
            record: history.get(definition.id).cloned().unwrap_or_default(),
        })
        .collect();

    let total_steps = steps.len();
    let completed_steps = steps
        .iter()
        .filter(|s| s.record.status == StepStatus::Completed)
        .count();
    let percentage = if total_steps == 0 {
        0
    } else {
        (completed_steps * 100 / total_steps) as u8
    };

    let in_progress = history
        .iter()
        .find(|(_, record)| record.status == StepStatus::InProgress)
        .map(|(step, _)| step.clone());

    let status = match current {
        CurrentStep::Completed => OverallStatus::Completed,
        CurrentStep::Failed => OverallStatus::Failed,
        _ if in_progress.is_some() => OverallStatus::Running,
        _ => OverallStatus::Idle,
    };

    let phase = match status {
        OverallStatus::Idle => WorkflowPhase::Idle,
        OverallStatus::Completed => WorkflowPhase::Completed,
        OverallStatus::Running => WorkflowPhase::Running {
            step: match &current {
                CurrentStep::Step(step) => Some(step.clone()),
                _ => in_progress,
            },
        },
        OverallStatus::Failed => {
            let failed = history
                .iter()
                .filter(|(_, record)| record.status == StepStatus::Failed)
                .max_by_key(|(_, record)| record.failed_at);
            WorkflowPhase::Failed {
                step: failed.map(|(step, _)| step.clone()),
                reason: failed.and_then(|(_, record)| record.error_message.clone()),
            }
        }
    };

    WorkflowState {
        workflow: bag
            .get_opt(KEY_WORKFLOW)
            .and_then(Value::as_str)
            .map(str::to_string),
        status,
        phase,
        current_step: current.as_stored().map(str::to_string),
        steps,
        completed_steps,
        total_steps,
        percentage,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
