//! Driving a chain from its first step to completion or the first halt.
//!
//! Steps run one at a time, each in its own task under its policy timeout.
//! A step that aborts (storage error, timeout, panic) before its execution
//! record is final is retried while tries remain; otherwise the
//! terminal-failure hook records the failure. A step that fails on its
//! script halts the chain immediately.

use std::sync::Arc;
use std::time::Duration;

use rigger_core::channels::{EVENT_WORKFLOW_COMPLETED, EVENT_WORKFLOW_FAILED};
use rigger_core::entity::{EntityKind, EntityRef};
use rigger_core::error::CoreError;
use rigger_core::pipelines::Pipeline;
use rigger_core::scripting::executor::ScriptExecutor;
use rigger_core::types::DbId;
use rigger_core::workflow::{CurrentStep, StepDefinition};
use rigger_events::EventBus;
use serde::Serialize;

use crate::context::{ChainContext, ChainSettings, ContextParts, StatusTransitions};
use crate::error::{PipelineError, PipelineResult};
use crate::orchestrator::{self, HaltReason, StepHalt, StepOutcome};
use crate::step::Step;
use crate::store::{EntityStore, ExecutionStore};
use crate::tracker::StepTracker;

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(900);

/// Timeout and try count of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub timeout: Duration,
    pub tries: u32,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STEP_TIMEOUT,
            tries: 1,
        }
    }
}

impl StepPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Timeout handed to the engine: 90% of the step timeout, so the script
    /// is killed and recorded before the runner gives up on the step.
    pub fn engine_timeout(&self) -> Duration {
        self.timeout * 9 / 10
    }
}

pub struct ChainStep {
    pub step: Arc<dyn Step>,
    pub policy: StepPolicy,
}

impl ChainStep {
    pub fn new(step: impl Step + 'static, policy: StepPolicy) -> Self {
        Self {
            step: Arc::new(step),
            policy,
        }
    }
}

/// A fixed sequence of steps against one entity.
pub struct Chain {
    pub pipeline: Pipeline,
    pub entity: EntityRef,
    pub steps: Vec<ChainStep>,
    pub transitions: StatusTransitions,
    /// A pending record claimed from the queue, used by the first script.
    pub preassigned_execution: Option<DbId>,
}

impl Chain {
    pub fn definitions(&self) -> Vec<StepDefinition> {
        self.steps.iter().map(|s| *s.step.definition()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChainOutcome {
    Completed,
    Failed { step: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub pipeline: Pipeline,
    pub entity: EntityRef,
    pub outcome: ChainOutcome,
}

/// Runs chains against shared services.
#[derive(Clone)]
pub struct ChainRunner {
    store: Arc<dyn EntityStore>,
    records: Arc<dyn ExecutionStore>,
    executor: Arc<dyn ScriptExecutor>,
    bus: Arc<EventBus>,
    settings: Arc<ChainSettings>,
}

impl ChainRunner {
    pub fn new(
        store: Arc<dyn EntityStore>,
        records: Arc<dyn ExecutionStore>,
        executor: Arc<dyn ScriptExecutor>,
        bus: Arc<EventBus>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            store,
            records,
            executor,
            bus,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Run `chain` to its end.
    ///
    /// `Err` means the chain could not be started or finished bookkeeping;
    /// a step failure is an `Ok` report with [`ChainOutcome::Failed`]. Once
    /// the entity is loaded, an `Err` also leaves it marked failed as far as
    /// the store allows.
    pub async fn run(&self, chain: Chain) -> PipelineResult<ChainReport> {
        let ctx = Arc::new(self.context(&chain).await?);

        match self.drive(&ctx, &chain).await {
            Ok(outcome) => Ok(ChainReport {
                pipeline: chain.pipeline,
                entity: chain.entity,
                outcome,
            }),
            Err(e) => {
                Self::on_chain_error(&ctx, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &Arc<ChainContext>,
        chain: &Chain,
    ) -> PipelineResult<ChainOutcome> {
        ctx.tracker.begin(chain.transitions.running).await?;
        ctx.audit
            .append(chain.entity, &format!("Starting {}", chain.pipeline), true)
            .await?;
        tracing::info!(
            entity = %chain.entity,
            pipeline = %chain.pipeline,
            steps = chain.steps.len(),
            "Chain started",
        );

        for chain_step in &chain.steps {
            if let Err(halt) = self.run_with_policy(ctx, chain_step).await {
                tracing::warn!(
                    entity = %chain.entity,
                    pipeline = %chain.pipeline,
                    step = %halt.step,
                    reason = %halt.reason,
                    "Chain halted",
                );
                return Ok(ChainOutcome::Failed {
                    step: halt.step,
                    reason: halt.reason.to_string(),
                });
            }
        }

        ctx.tracker.set_current(&CurrentStep::Completed).await?;
        if let Some(status) = chain.transitions.completed {
            ctx.store.set_status(chain.entity, status).await?;
        }
        ctx.audit
            .append(chain.entity, &format!("{} completed", chain.pipeline), true)
            .await?;
        ctx.tracker.publish(EVENT_WORKFLOW_COMPLETED).await;
        tracing::info!(entity = %chain.entity, pipeline = %chain.pipeline, "Chain completed");

        Ok(ChainOutcome::Completed)
    }

    /// Best-effort failure marking for an error outside any step. Each write
    /// is attempted on its own and failures are only logged.
    async fn on_chain_error(ctx: &ChainContext, error: &PipelineError) {
        let message = error.to_string();
        tracing::error!(entity = %ctx.entity, pipeline = %ctx.pipeline, error = %message, "Chain aborted");

        if let Some(status) = ctx.transitions.failed {
            if let Err(e) = ctx.store.set_status(ctx.entity, status).await {
                tracing::warn!(entity = %ctx.entity, error = %e, "Failed to mark entity failed");
            }
        }
        if let Err(e) = ctx.tracker.set_current(&CurrentStep::Failed).await {
            tracing::warn!(entity = %ctx.entity, error = %e, "Failed to set current step");
        }
        if let Err(e) = ctx
            .audit
            .append(ctx.entity, &format!("{} failed: {message}", ctx.pipeline), true)
            .await
        {
            tracing::warn!(entity = %ctx.entity, error = %e, "Failed to append failure note");
        }
        ctx.tracker.publish(EVENT_WORKFLOW_FAILED).await;
    }

    async fn context(&self, chain: &Chain) -> PipelineResult<ChainContext> {
        let (host, attempt) = match chain.entity.kind {
            EntityKind::Host => (Some(self.store.host(chain.entity.id).await?), None),
            EntityKind::WorkAttempt => {
                let attempt = self.store.attempt(chain.entity.id).await?;
                let host = self.store.host(attempt.host_id).await?;
                (Some(host), Some(attempt))
            }
            EntityKind::ExecutionRecord => {
                return Err(CoreError::UnsupportedEntity(chain.entity.kind).into())
            }
        };

        let tracker = StepTracker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            chain.entity,
            chain.pipeline,
            chain.definitions(),
        );
        Ok(ChainContext::new(
            ContextParts {
                pipeline: chain.pipeline,
                entity: chain.entity,
                host,
                attempt,
                transitions: chain.transitions,
                preassigned_execution: chain.preassigned_execution,
            },
            Arc::clone(&self.settings),
            Arc::clone(&self.store),
            Arc::clone(&self.records),
            Arc::clone(&self.executor),
            tracker,
        ))
    }

    async fn run_with_policy(
        &self,
        ctx: &Arc<ChainContext>,
        chain_step: &ChainStep,
    ) -> Result<StepOutcome, StepHalt> {
        let step_id = chain_step.step.definition().id;
        let policy = chain_step.policy;
        let tries = policy.tries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let task_ctx = Arc::clone(ctx);
            let task_step = Arc::clone(&chain_step.step);
            let handle = tokio::spawn(async move {
                orchestrator::run_step(&task_ctx, task_step.as_ref(), &policy).await
            });
            let abort_handle = handle.abort_handle();

            let result = match tokio::time::timeout(policy.timeout, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(StepHalt::aborted(
                    step_id,
                    PipelineError::StepFailed {
                        step: step_id.to_string(),
                        message: format!("step task died: {join_err}"),
                    },
                )),
                Err(_) => {
                    abort_handle.abort();
                    Err(StepHalt::aborted(
                        step_id,
                        PipelineError::StepFailed {
                            step: step_id.to_string(),
                            message: format!(
                                "step exceeded its {}s timeout",
                                policy.timeout.as_secs()
                            ),
                        },
                    ))
                }
            };

            match result {
                Err(StepHalt {
                    step,
                    reason: HaltReason::Aborted(error),
                    retryable,
                }) => {
                    if retryable && attempt < tries {
                        tracing::warn!(
                            entity = %ctx.entity,
                            step = step_id,
                            attempt,
                            tries,
                            error = %error,
                            "Step aborted, retrying",
                        );
                        orchestrator::abandon_active(ctx, &error.to_string()).await;
                        continue;
                    }
                    orchestrator::on_terminal_failure(ctx, chain_step.step.as_ref(), &error).await;
                    return Err(StepHalt {
                        step,
                        reason: HaltReason::Aborted(error),
                        retryable,
                    });
                }
                other => return other,
            }
        }
    }
}
