//! Storage seams of the orchestrator.
//!
//! Steps never talk to the database directly; everything they persist goes
//! through these two traits so chains can run against
//! [`MemoryStore`](crate::memory::MemoryStore) in tests.

use async_trait::async_trait;
use rigger_core::entity::{EntityKind, EntityRef};
use rigger_core::error::CoreError;
use rigger_core::metadata::{MergeMode, MetadataBag};
use rigger_core::scripting::target::RemoteHost;
use rigger_core::status::{AttemptStatus, HostStatus};
use rigger_core::types::DbId;
use rigger_db::models::attempt::ContainerIdentity;
use rigger_db::models::execution::{ExecutionOutcome, NewExecutionRecord};
use serde_json::{Map, Value};

use crate::error::PipelineResult;

/// An in-place edit applied to a freshly loaded bag.
pub type MetadataEdit = Box<dyn FnOnce(&mut MetadataBag) + Send>;

/// A status of either kind of tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Host(HostStatus),
    Attempt(AttemptStatus),
}

impl EntityStatus {
    pub fn kind(self) -> EntityKind {
        match self {
            Self::Host(_) => EntityKind::Host,
            Self::Attempt(_) => EntityKind::WorkAttempt,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Host(status) => status.name(),
            Self::Attempt(status) => status.name(),
        }
    }
}

/// Connection details of the host a chain runs against.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub id: DbId,
    pub name: String,
    pub target: RemoteHost,
}

/// Identity of the work attempt a workspace chain provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    pub id: DbId,
    pub user_id: DbId,
    pub task_id: DbId,
    pub host_id: DbId,
}

/// Metadata bags, notes and status of hosts and work attempts.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn metadata(&self, entity: EntityRef) -> PipelineResult<MetadataBag>;

    /// Load the bag, apply `edit` and persist it, with no other writer in
    /// between. Returns the bag as stored.
    async fn update_metadata(
        &self,
        entity: EntityRef,
        edit: MetadataEdit,
    ) -> PipelineResult<MetadataBag>;

    /// Append one already formatted line to the entity's notes.
    async fn append_note(&self, entity: EntityRef, line: &str) -> PipelineResult<()>;

    async fn set_status(&self, entity: EntityRef, status: EntityStatus) -> PipelineResult<()>;

    async fn status_name(&self, entity: EntityRef) -> PipelineResult<String>;

    async fn host(&self, id: DbId) -> PipelineResult<HostInfo>;

    async fn attempt(&self, id: DbId) -> PipelineResult<AttemptInfo>;

    async fn set_container(
        &self,
        attempt_id: DbId,
        container: &ContainerIdentity,
    ) -> PipelineResult<()>;

    async fn merge_metadata(
        &self,
        entity: EntityRef,
        partial: Map<String, Value>,
        mode: MergeMode,
    ) -> PipelineResult<MetadataBag> {
        self.update_metadata(entity, Box::new(move |bag| bag.merge(partial, mode)))
            .await
    }

    async fn remove_metadata(
        &self,
        entity: EntityRef,
        keys: &'static [&'static str],
    ) -> PipelineResult<MetadataBag> {
        self.update_metadata(entity, Box::new(move |bag| bag.remove(keys)))
            .await
    }
}

/// The execution record log.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a `running` record.
    async fn create(&self, record: NewExecutionRecord) -> PipelineResult<DbId>;

    /// Write the terminal state. `false` if the record was already final.
    async fn finalize(&self, id: DbId, outcome: &ExecutionOutcome) -> PipelineResult<bool>;
}

/// Reject a status of the wrong entity kind.
pub(crate) fn check_status_kind(entity: EntityRef, status: EntityStatus) -> PipelineResult<()> {
    if status.kind() == entity.kind {
        Ok(())
    } else {
        Err(CoreError::Internal(format!(
            "cannot set {} status '{}' on {entity}",
            status.kind(),
            status.name()
        ))
        .into())
    }
}

pub(crate) fn not_found(entity: EntityRef) -> CoreError {
    CoreError::NotFound {
        entity: entity.kind.as_str(),
        id: entity.id,
    }
}
