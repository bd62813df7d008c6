//! Models for the `execution_records` table.
//!
//! A record is created `running` when a step starts its script (or
//! `pending` when a single-script request is queued) and is finalised
//! exactly once through an [`ExecutionOutcome`].

use rigger_core::scripting::executor::ExecutionResult;
use rigger_core::status::{ExecutionStatus, StatusId};
use rigger_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One script execution attempt.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExecutionRecord {
    pub id: DbId,
    pub status_id: StatusId,
    /// Joined from `execution_statuses.name`.
    pub status_name: String,
    pub template: String,
    pub name: String,
    pub script: String,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    pub metadata: serde_json::Value,
    pub user_id: Option<DbId>,
    pub host_id: Option<DbId>,
    pub task_id: Option<DbId>,
    pub attempt_id: Option<DbId>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub terminated_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
    pub timed_out_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ExecutionRecord {
    pub fn status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::from_id(self.status_id)
    }
}

/// DTO for inserting a record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewExecutionRecord {
    pub template: String,
    pub name: String,
    /// Rendered script text, without preamble.
    pub script: String,
    pub metadata: serde_json::Value,
    pub user_id: Option<DbId>,
    pub host_id: Option<DbId>,
    pub task_id: Option<DbId>,
    pub attempt_id: Option<DbId>,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process ran to exit. Status follows the exit code.
    Exited(ExecutionResult),
    /// The process exited 0 but the step could not use its output.
    Rejected {
        result: ExecutionResult,
        reason: String,
    },
    /// The process could not be run or the step died around it.
    Errored { message: String },
    /// The engine killed the process after its timeout.
    TimedOut { elapsed_ms: u64 },
}

/// Column values written by the terminal update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeColumns {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    pub completed: bool,
    pub failed: bool,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn columns(&self) -> OutcomeColumns {
        match self {
            Self::Exited(result) => OutcomeColumns {
                status: if result.successful {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                },
                output: Some(result.output.clone()),
                error_output: Some(result.error_output.clone()),
                exit_code: Some(result.exit_code),
                completed: true,
                failed: false,
                timed_out: false,
            },
            Self::Rejected { result, reason } => {
                let error_output = if result.error_output.trim().is_empty() {
                    reason.clone()
                } else {
                    format!("{}\n{reason}", result.error_output.trim_end())
                };
                OutcomeColumns {
                    status: ExecutionStatus::Failed,
                    output: Some(result.output.clone()),
                    error_output: Some(error_output),
                    exit_code: Some(result.exit_code),
                    completed: false,
                    failed: true,
                    timed_out: false,
                }
            }
            Self::Errored { message } => OutcomeColumns {
                status: ExecutionStatus::Failed,
                output: None,
                error_output: Some(message.clone()),
                exit_code: None,
                completed: false,
                failed: true,
                timed_out: false,
            },
            Self::TimedOut { elapsed_ms } => OutcomeColumns {
                status: ExecutionStatus::Terminated,
                output: None,
                error_output: Some(format!("Script timed out after {elapsed_ms}ms")),
                exit_code: None,
                completed: false,
                failed: true,
                timed_out: true,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stderr: &str) -> ExecutionResult {
        ExecutionResult::new("out".into(), stderr.into(), exit_code, 10)
    }

    fn all_outcomes() -> Vec<ExecutionOutcome> {
        vec![
            ExecutionOutcome::Exited(result(0, "")),
            ExecutionOutcome::Exited(result(1, "disk full")),
            ExecutionOutcome::Rejected {
                result: result(0, ""),
                reason: "no container info returned".into(),
            },
            ExecutionOutcome::Errored {
                message: "No such file or directory".into(),
            },
            ExecutionOutcome::TimedOut { elapsed_ms: 900_000 },
        ]
    }

    #[test]
    fn exactly_one_of_completed_or_failed() {
        for outcome in all_outcomes() {
            let cols = outcome.columns();
            assert!(cols.completed ^ cols.failed, "{outcome:?}");
            assert!(cols.status.is_terminal());
        }
    }

    #[test]
    fn exit_code_implies_both_streams() {
        for outcome in all_outcomes() {
            let cols = outcome.columns();
            if cols.exit_code.is_some() {
                assert!(cols.output.is_some() && cols.error_output.is_some());
            }
        }
    }

    #[test]
    fn completed_at_only_with_completed_or_failed_status() {
        for outcome in all_outcomes() {
            let cols = outcome.columns();
            if cols.completed {
                assert!(matches!(
                    cols.status,
                    ExecutionStatus::Completed | ExecutionStatus::Failed
                ));
            }
        }
    }

    #[test]
    fn nonzero_exit_is_failed_but_completed() {
        let cols = ExecutionOutcome::Exited(result(1, "disk full")).columns();
        assert_eq!(cols.status, ExecutionStatus::Failed);
        assert!(cols.completed);
        assert_eq!(cols.error_output.as_deref(), Some("disk full"));
    }

    #[test]
    fn rejection_reason_is_appended_to_stderr() {
        let cols = ExecutionOutcome::Rejected {
            result: result(0, "warning: pull slow\n"),
            reason: "no container info returned".into(),
        }
        .columns();
        assert_eq!(
            cols.error_output.as_deref(),
            Some("warning: pull slow\nno container info returned")
        );
    }

    #[test]
    fn timeout_is_terminated_with_timestamp() {
        let cols = ExecutionOutcome::TimedOut { elapsed_ms: 5 }.columns();
        assert_eq!(cols.status, ExecutionStatus::Terminated);
        assert!(cols.timed_out && cols.failed);
    }
}
