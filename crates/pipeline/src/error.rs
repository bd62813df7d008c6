use rigger_core::error::CoreError;
use rigger_core::scripting::executor::ScriptError;

/// Errors raised while driving a chain.
///
/// These are infrastructure problems (storage, engine, runtime). A script
/// that exits non-zero is not a `PipelineError`; it halts the chain through
/// [`StepHalt`](crate::orchestrator::StepHalt).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// The step died outside its own body (timeout, panic).
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
