//! Running one step of a chain.
//!
//! [`run_step`] is the whole life of a step: mark it current, render its
//! script, create the execution record, run the script, finalise the record,
//! and either apply the step's effects or record the failure on the entity.
//! The result tells the runner whether to go on.

use std::fmt;

use rigger_core::channels::EVENT_WORKFLOW_FAILED;
use rigger_core::error::CoreError;
use rigger_core::scripting::executor::{Delivery, ScriptError, ScriptInput};
use rigger_core::types::DbId;
use rigger_core::workflow::CurrentStep;
use rigger_db::models::execution::ExecutionOutcome;

use crate::context::ChainContext;
use crate::error::{PipelineError, PipelineResult};
use crate::runner::StepPolicy;
use crate::step::{Step, StepEffects};

/// The step finished; the chain advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue { execution_id: DbId },
}

/// Why a chain stopped.
#[derive(Debug)]
pub enum HaltReason {
    /// The script or its output was rejected. Already recorded on the
    /// entity.
    Failed(String),
    /// Infrastructure failure around the step. Not yet recorded; the runner
    /// may retry while [`StepHalt::retryable`] holds.
    Aborted(PipelineError),
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => f.write_str(reason),
            Self::Aborted(error) => write!(f, "{error}"),
        }
    }
}

/// The chain stops at `step`.
#[derive(Debug)]
pub struct StepHalt {
    pub step: String,
    pub reason: HaltReason,
    /// False once the step's execution record is final. Running the step
    /// again would repeat a script whose outcome is already recorded.
    pub retryable: bool,
}

impl StepHalt {
    pub fn failed(step: &str, reason: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            reason: HaltReason::Failed(reason.into()),
            retryable: false,
        }
    }

    pub fn aborted(step: &str, error: impl Into<PipelineError>) -> Self {
        Self {
            step: step.to_string(),
            reason: HaltReason::Aborted(error.into()),
            retryable: true,
        }
    }

    /// An abort raised after the execution record was finalised.
    pub fn aborted_after_finalize(step: &str, error: impl Into<PipelineError>) -> Self {
        Self {
            retryable: false,
            ..Self::aborted(step, error)
        }
    }
}

/// Run one step to completion.
pub async fn run_step(
    ctx: &ChainContext,
    step: &dyn Step,
    policy: &StepPolicy,
) -> Result<StepOutcome, StepHalt> {
    let definition = step.definition();
    let step_id = definition.id;
    let abort = |e: PipelineError| StepHalt::aborted(step_id, e);
    let abort_final = |e: PipelineError| StepHalt::aborted_after_finalize(step_id, e);

    ctx.tracker
        .set_current(&CurrentStep::Step(step_id.to_string()))
        .await
        .map_err(abort)?;
    ctx.tracker.start_step(step_id).await.map_err(abort)?;
    ctx.audit
        .append(ctx.entity, &format!("{}...", definition.label), true)
        .await
        .map_err(abort)?;
    tracing::info!(entity = %ctx.entity, pipeline = %ctx.pipeline, step = step_id, "Step started");

    let bag = ctx.store.metadata(ctx.entity).await.map_err(abort)?;
    let input = ctx.step_input(&bag);

    let prepared = step.prepare(&input).and_then(|task| {
        let script = task.job.render()?;
        Ok((task, script))
    });
    let (task, script) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!(entity = %ctx.entity, step = step_id, error = %e, "Step could not build its script");
            if let Some(id) = ctx.take_preassigned().await {
                let outcome = ExecutionOutcome::Errored {
                    message: e.to_string(),
                };
                finalize(ctx, id, &outcome).await.map_err(abort)?;
            }
            return Err(record_failure(ctx, step, e.to_string()).await);
        }
    };

    let execution_id = match ctx.take_preassigned().await {
        Some(id) => id,
        None => ctx
            .records
            .create(ctx.new_record(step_id, &task, &script))
            .await
            .map_err(abort)?,
    };
    ctx.set_active(Some(execution_id)).await;

    let engine_timeout = policy.engine_timeout();
    let script_input = ScriptInput::new(script).with_target(ctx.target());
    let script_input = match step.delivery() {
        Delivery::Stdin => script_input.via_stdin(engine_timeout),
        Delivery::TempFile => script_input.with_timeout(engine_timeout),
    };

    let (outcome, reason) = match ctx.executor.execute(script_input).await {
        Ok(result) if result.successful => match step.on_success(&result, &input) {
            Ok(effects) => {
                finalize(ctx, execution_id, &ExecutionOutcome::Exited(result))
                    .await
                    .map_err(abort)?;
                ctx.set_active(None).await;
                apply_effects(ctx, effects).await.map_err(abort_final)?;
                ctx.tracker.complete_step(step_id).await.map_err(abort_final)?;
                ctx.audit
                    .append(ctx.entity, &format!("{} completed", definition.label), true)
                    .await
                    .map_err(abort_final)?;
                tracing::info!(
                    entity = %ctx.entity,
                    step = step_id,
                    execution_id,
                    "Step completed",
                );
                return Ok(StepOutcome::Continue { execution_id });
            }
            Err(e) => {
                let reason = e.to_string();
                (
                    ExecutionOutcome::Rejected {
                        result,
                        reason: reason.clone(),
                    },
                    reason,
                )
            }
        },
        Ok(result) => {
            let reason = result.failure_message();
            (ExecutionOutcome::Exited(result), reason)
        }
        Err(ScriptError::Timeout { elapsed_ms }) => (
            ExecutionOutcome::TimedOut { elapsed_ms },
            ScriptError::Timeout { elapsed_ms }.to_string(),
        ),
        Err(e) => {
            let message = e.to_string();
            (
                ExecutionOutcome::Errored {
                    message: message.clone(),
                },
                message,
            )
        }
    };

    tracing::error!(
        entity = %ctx.entity,
        step = step_id,
        execution_id,
        reason = %reason,
        "Step failed",
    );
    finalize(ctx, execution_id, &outcome).await.map_err(abort)?;
    ctx.set_active(None).await;
    Err(record_failure(ctx, step, reason).await)
}

/// Finalise the step's record. A record that was already final is kept as
/// it is and logged.
async fn finalize(
    ctx: &ChainContext,
    execution_id: DbId,
    outcome: &ExecutionOutcome,
) -> PipelineResult<()> {
    if !ctx.records.finalize(execution_id, outcome).await? {
        tracing::warn!(
            entity = %ctx.entity,
            execution_id,
            "Execution record was already final",
        );
    }
    Ok(())
}

async fn apply_effects(ctx: &ChainContext, effects: StepEffects) -> PipelineResult<()> {
    if !effects.metadata.is_empty() {
        ctx.store
            .merge_metadata(
                ctx.entity,
                effects.metadata,
                rigger_core::metadata::MergeMode::Overwrite,
            )
            .await?;
    }
    if let Some(container) = effects.container {
        let attempt = ctx.attempt.ok_or_else(|| {
            CoreError::Internal(format!("{} has no attempt to attach a container to", ctx.entity))
        })?;
        ctx.store.set_container(attempt.id, &container).await?;
    }
    Ok(())
}

/// Record a rejected step on the entity and halt. The step's record, if
/// any, is already final, so an error here is not retried.
async fn record_failure(ctx: &ChainContext, step: &dyn Step, reason: String) -> StepHalt {
    let step_id = step.definition().id;
    match mark_failed(ctx, step, &reason).await {
        Ok(()) => StepHalt::failed(step_id, reason),
        Err(e) => StepHalt::aborted_after_finalize(step_id, e),
    }
}

async fn mark_failed(ctx: &ChainContext, step: &dyn Step, reason: &str) -> PipelineResult<()> {
    let definition = step.definition();
    if let Some(status) = ctx.transitions.failed {
        ctx.store.set_status(ctx.entity, status).await?;
    }
    ctx.tracker.fail_step(definition.id, reason).await?;
    ctx.tracker.set_current(&CurrentStep::Failed).await?;
    ctx.audit
        .append(
            ctx.entity,
            &format!("{} failed: {reason}", definition.label),
            true,
        )
        .await?;
    ctx.tracker.publish(EVENT_WORKFLOW_FAILED).await;
    Ok(())
}

/// Best-effort cleanup once the runner gives up on a step.
///
/// Every write is attempted independently and failures are only logged, so
/// a broken store never hides `error`.
pub async fn on_terminal_failure(ctx: &ChainContext, step: &dyn Step, error: &PipelineError) {
    let definition = step.definition();
    let message = error.to_string();
    tracing::error!(entity = %ctx.entity, step = definition.id, error = %message, "Step gave up");

    abandon_active(ctx, &message).await;

    if let Some(status) = ctx.transitions.failed {
        if let Err(e) = ctx.store.set_status(ctx.entity, status).await {
            tracing::warn!(entity = %ctx.entity, error = %e, "Failed to mark entity failed");
        }
    }
    if let Err(e) = ctx.tracker.fail_step(definition.id, &message).await {
        tracing::warn!(entity = %ctx.entity, error = %e, "Failed to mark step failed");
    }
    if let Err(e) = ctx.tracker.set_current(&CurrentStep::Failed).await {
        tracing::warn!(entity = %ctx.entity, error = %e, "Failed to set current step");
    }
    if let Err(e) = ctx
        .audit
        .append(
            ctx.entity,
            &format!("{} failed: {message}", definition.label),
            true,
        )
        .await
    {
        tracing::warn!(entity = %ctx.entity, error = %e, "Failed to append failure note");
    }
    ctx.tracker.publish(EVENT_WORKFLOW_FAILED).await;
}

/// Finalise the record of a script the step never got to finalise.
pub async fn abandon_active(ctx: &ChainContext, message: &str) {
    let Some(id) = ctx.take_active().await else {
        return;
    };
    let outcome = ExecutionOutcome::Errored {
        message: message.to_string(),
    };
    match ctx.records.finalize(id, &outcome).await {
        Ok(true) => tracing::debug!(execution_id = id, "Abandoned execution finalised"),
        Ok(false) => tracing::warn!(execution_id = id, "Abandoned execution was already final"),
        Err(e) => tracing::warn!(execution_id = id, error = %e, "Failed to finalise abandoned execution"),
    }
}
