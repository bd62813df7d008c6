//! Background chain dispatcher.
//!
//! Polls every `poll_interval` for claimable work and starts one chain per
//! claim, up to `max_concurrent` at a time. Claims go through
//! `FOR UPDATE SKIP LOCKED`, so several workers can share one database.
//! Within one process, [`EntityLocks`] keeps two chains off the same entity.

use std::sync::Arc;
use std::time::Duration;

use rigger_core::entity::{EntityKind, EntityRef};
use rigger_core::error::CoreError;
use rigger_core::scripts::{ScriptJob, ScriptTask};
use rigger_core::types::DbId;
use rigger_db::models::execution::{ExecutionOutcome, ExecutionRecord};
use rigger_db::repositories::{
    EntityStateRepo, ExecutionRecordRepo, HostRepo, StateTable, WorkAttemptRepo,
};
use rigger_pipeline::chains::{provision_host, provision_workspace, run_script};
use rigger_pipeline::{Chain, ChainOutcome, ChainRunner};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::locks::{EntityGuard, EntityLocks};

/// Default polling interval for the dispatcher loop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One claimed unit of work.
#[derive(Debug)]
enum Work {
    Host(DbId),
    Attempt(DbId),
    Script(ExecutionRecord),
}

impl Work {
    fn describe(&self) -> String {
        match self {
            Self::Host(id) => format!("host#{id}"),
            Self::Attempt(id) => format!("work_attempt#{id}"),
            Self::Script(record) => format!("execution#{}", record.id),
        }
    }
}

/// Entities a dispatch cycle must not claim work for.
#[derive(Debug, Default)]
struct BusyEntities {
    hosts: Vec<DbId>,
    attempts: Vec<DbId>,
}

impl BusyEntities {
    fn from_locks(locks: &EntityLocks) -> Self {
        Self {
            hosts: locks.held_ids(EntityKind::Host),
            attempts: locks.held_ids(EntityKind::WorkAttempt),
        }
    }

    fn insert(&mut self, entity: EntityRef) {
        match entity.kind {
            EntityKind::Host => self.hosts.push(entity.id),
            EntityKind::WorkAttempt => self.attempts.push(entity.id),
            EntityKind::ExecutionRecord => {}
        }
    }
}

pub struct ChainDispatcher {
    pool: PgPool,
    runner: ChainRunner,
    locks: EntityLocks,
    slots: Arc<Semaphore>,
    tasks: TaskTracker,
    poll_interval: Duration,
}

impl ChainDispatcher {
    pub fn new(pool: PgPool, runner: ChainRunner, max_concurrent: usize) -> Self {
        Self {
            pool,
            runner,
            locks: EntityLocks::new(),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: TaskTracker::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Run the dispatcher loop until the cancellation token is triggered,
    /// then wait for running chains to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_concurrent = self.slots.available_permits(),
            "Chain dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(running = self.tasks.len(), "Chain dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_once().await {
                        tracing::error!(error = %e, "Dispatch cycle failed");
                    }
                }
            }
        }

        self.drain().await;
        tracing::info!("Chain dispatcher stopped");
    }

    /// Wait for every chain started so far.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// One dispatch cycle: claim and start work while slots are free.
    ///
    /// Entities with a running chain are left out of the claim queries, so
    /// work for a busy host never hides work for an idle one.
    ///
    /// Returns the number of chains started.
    pub async fn dispatch_once(&self) -> Result<usize, sqlx::Error> {
        let mut started = 0;
        let mut busy = BusyEntities::from_locks(&self.locks);

        loop {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                break;
            };
            let Some(work) = self.claim_next(&busy).await? else {
                break;
            };
            let Some(entity) = self.owning_entity(&work).await? else {
                continue;
            };

            let Some(guard) = self.locks.try_acquire(entity) else {
                // Locked since the cycle started. The claim goes back and the
                // entity is skipped for the rest of this cycle.
                tracing::debug!(entity = %entity, work = %work.describe(), "Entity busy, releasing claim");
                self.release(&work).await?;
                busy.insert(entity);
                continue;
            };

            match self.build_chain(&work) {
                Ok(chain) => {
                    self.spawn(work, chain, guard, permit);
                    started += 1;
                }
                Err(e) => {
                    tracing::error!(work = %work.describe(), error = %e, "Cannot build chain");
                    self.reject(&work, &e.to_string()).await?;
                }
            }
        }

        Ok(started)
    }

    async fn claim_next(&self, busy: &BusyEntities) -> Result<Option<Work>, sqlx::Error> {
        if let Some(record) = ExecutionRecordRepo::claim_next_queued(&self.pool, &busy.hosts).await? {
            return Ok(Some(Work::Script(record)));
        }
        if let Some(id) = HostRepo::claim_next_pending(&self.pool, &busy.hosts).await? {
            return Ok(Some(Work::Host(id)));
        }
        if let Some(id) = WorkAttemptRepo::claim_next_pending(&self.pool, &busy.attempts).await? {
            return Ok(Some(Work::Attempt(id)));
        }
        Ok(None)
    }

    /// The entity whose lock the chain needs. A script record without a
    /// host is failed on the spot.
    async fn owning_entity(&self, work: &Work) -> Result<Option<EntityRef>, sqlx::Error> {
        match work {
            Work::Host(id) => Ok(Some(EntityRef::host(*id))),
            Work::Attempt(id) => Ok(Some(EntityRef::attempt(*id))),
            Work::Script(record) => match record.host_id {
                Some(host_id) => Ok(Some(EntityRef::host(host_id))),
                None => {
                    tracing::error!(execution_id = record.id, "Queued script has no host");
                    self.reject(work, "execution record has no host").await?;
                    Ok(None)
                }
            },
        }
    }

    fn build_chain(&self, work: &Work) -> Result<Chain, CoreError> {
        let settings = self.runner.settings();
        match work {
            Work::Host(id) => Ok(provision_host(*id, settings)),
            Work::Attempt(id) => Ok(provision_workspace(*id, settings)),
            Work::Script(record) => {
                let host_id = record
                    .host_id
                    .ok_or_else(|| CoreError::Internal("execution record has no host".into()))?;
                let params = record.metadata.get("params").cloned().unwrap_or(Value::Null);
                let job = ScriptJob::from_template(&record.template, params)?;
                let task = ScriptTask::named(job, record.name.clone());
                Ok(run_script(host_id, task, Some(record.id), settings))
            }
        }
    }

    fn spawn(&self, work: Work, chain: Chain, guard: EntityGuard, permit: OwnedSemaphorePermit) {
        let runner = self.runner.clone();
        let pool = self.pool.clone();
        tracing::info!(
            entity = %guard.entity(),
            pipeline = %chain.pipeline,
            work = %work.describe(),
            "Starting chain",
        );

        self.tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match runner.run(chain).await {
                Ok(report) => match &report.outcome {
                    ChainOutcome::Completed => {
                        tracing::info!(entity = %report.entity, pipeline = %report.pipeline, "Chain finished");
                    }
                    ChainOutcome::Failed { step, reason } => {
                        tracing::warn!(
                            entity = %report.entity,
                            pipeline = %report.pipeline,
                            step = %step,
                            reason = %reason,
                            "Chain failed",
                        );
                    }
                },
                Err(e) => {
                    // The claim is kept: an entity the runner cannot load
                    // would fail the same way on every poll.
                    tracing::error!(work = %work.describe(), error = %e, "Chain aborted");
                    if let Work::Script(record) = &work {
                        let outcome = ExecutionOutcome::Errored {
                            message: e.to_string(),
                        };
                        if let Err(e) = ExecutionRecordRepo::finalize(&pool, record.id, &outcome).await {
                            tracing::warn!(execution_id = record.id, error = %e, "Failed to finalise aborted script");
                        }
                    }
                }
            }
        });
    }

    /// Give a claim back.
    async fn release(&self, work: &Work) -> Result<(), sqlx::Error> {
        match work {
            Work::Host(id) => EntityStateRepo::release_claim(&self.pool, StateTable::Hosts, *id).await,
            Work::Attempt(id) => {
                EntityStateRepo::release_claim(&self.pool, StateTable::WorkAttempts, *id).await
            }
            Work::Script(record) => ExecutionRecordRepo::release_claim(&self.pool, record.id)
                .await
                .map(|_| ()),
        }
    }

    /// Fail work that can never run. Only queued scripts have a record to
    /// fail; claimed hosts and attempts keep their claim.
    async fn reject(&self, work: &Work, message: &str) -> Result<(), sqlx::Error> {
        if let Work::Script(record) = work {
            let outcome = ExecutionOutcome::Errored {
                message: message.to_string(),
            };
            ExecutionRecordRepo::finalize(&self.pool, record.id, &outcome).await?;
        }
        Ok(())
    }
}
