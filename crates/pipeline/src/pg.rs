//! PostgreSQL-backed stores.

use async_trait::async_trait;
use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::metadata::MetadataBag;
use rigger_core::types::DbId;
use rigger_db::models::attempt::ContainerIdentity;
use rigger_db::models::execution::{ExecutionOutcome, NewExecutionRecord};
use rigger_db::repositories::{
    EntityStateRepo, ExecutionRecordRepo, HostRepo, StateTable, WorkAttemptRepo,
};
use sqlx::PgPool;

use crate::error::PipelineResult;
use crate::store::{
    check_status_kind, not_found, AttemptInfo, EntityStatus, EntityStore, ExecutionStore,
    HostInfo, MetadataEdit,
};

/// Both store traits over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn state_table(entity: EntityRef) -> Result<StateTable, CoreError> {
    StateTable::for_kind(entity.kind).ok_or(CoreError::UnsupportedEntity(entity.kind))
}

#[async_trait]
impl EntityStore for PgStore {
    async fn metadata(&self, entity: EntityRef) -> PipelineResult<MetadataBag> {
        let table = state_table(entity)?;
        let (value, version) = EntityStateRepo::load_metadata(&self.pool, table, entity.id)
            .await?
            .ok_or_else(|| not_found(entity))?;
        Ok(MetadataBag::new(entity, value, version))
    }

    async fn update_metadata(
        &self,
        entity: EntityRef,
        edit: MetadataEdit,
    ) -> PipelineResult<MetadataBag> {
        let table = state_table(entity)?;
        let mut tx = self.pool.begin().await?;

        let (value, version) = EntityStateRepo::lock_metadata(&mut *tx, table, entity.id)
            .await?
            .ok_or_else(|| not_found(entity))?;
        let mut bag = MetadataBag::new(entity, value, version);
        edit(&mut bag);

        EntityStateRepo::store_metadata(&mut *tx, table, entity.id, &bag.to_value(), bag.version())
            .await?;
        tx.commit().await?;
        Ok(bag)
    }

    async fn append_note(&self, entity: EntityRef, line: &str) -> PipelineResult<()> {
        let table = state_table(entity)?;
        if EntityStateRepo::append_note(&self.pool, table, entity.id, line).await? {
            Ok(())
        } else {
            Err(not_found(entity).into())
        }
    }

    async fn set_status(&self, entity: EntityRef, status: EntityStatus) -> PipelineResult<()> {
        check_status_kind(entity, status)?;
        let updated = match status {
            EntityStatus::Host(status) => HostRepo::set_status(&self.pool, entity.id, status).await?,
            EntityStatus::Attempt(status) => {
                WorkAttemptRepo::set_status(&self.pool, entity.id, status).await?
            }
        };
        if !updated {
            return Err(not_found(entity).into());
        }
        tracing::debug!(entity = %entity, status = status.name(), "Entity status updated");
        Ok(())
    }

    async fn status_name(&self, entity: EntityRef) -> PipelineResult<String> {
        EntityStateRepo::status_name(&self.pool, entity)
            .await?
            .ok_or_else(|| not_found(entity).into())
    }

    async fn host(&self, id: DbId) -> PipelineResult<HostInfo> {
        let host = HostRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| not_found(EntityRef::host(id)))?;
        Ok(HostInfo {
            id: host.id,
            target: host.remote_target(),
            name: host.name,
        })
    }

    async fn attempt(&self, id: DbId) -> PipelineResult<AttemptInfo> {
        let attempt = WorkAttemptRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| not_found(EntityRef::attempt(id)))?;
        Ok(AttemptInfo {
            id: attempt.id,
            user_id: attempt.user_id,
            task_id: attempt.task_id,
            host_id: attempt.host_id,
        })
    }

    async fn set_container(
        &self,
        attempt_id: DbId,
        container: &ContainerIdentity,
    ) -> PipelineResult<()> {
        if WorkAttemptRepo::set_container(&self.pool, attempt_id, container).await? {
            Ok(())
        } else {
            Err(not_found(EntityRef::attempt(attempt_id)).into())
        }
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create(&self, record: NewExecutionRecord) -> PipelineResult<DbId> {
        Ok(ExecutionRecordRepo::create(&self.pool, &record).await?)
    }

    async fn finalize(&self, id: DbId, outcome: &ExecutionOutcome) -> PipelineResult<bool> {
        Ok(ExecutionRecordRepo::finalize(&self.pool, id, outcome).await?)
    }
}
