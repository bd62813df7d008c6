//! In-memory stores for tests and local dry runs.
//!
//! Mirrors the semantics of [`PgStore`](crate::pg::PgStore): metadata edits
//! are serialised by one lock, notes append line by line, and a record can
//! be finalised once.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use rigger_core::entity::EntityRef;
use rigger_core::error::CoreError;
use rigger_core::metadata::MetadataBag;
use rigger_core::status::{AttemptStatus, HostStatus};
use rigger_core::types::DbId;
use rigger_db::models::attempt::ContainerIdentity;
use rigger_db::models::execution::{ExecutionOutcome, NewExecutionRecord};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::PipelineResult;
use crate::store::{
    check_status_kind, not_found, AttemptInfo, EntityStatus, EntityStore, ExecutionStore,
    HostInfo, MetadataEdit,
};

/// Stored state of one host or work attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub metadata: Value,
    pub version: i64,
    pub notes: Vec<String>,
    pub status: String,
}

impl EntitySnapshot {
    fn new(status: &str) -> Self {
        Self {
            metadata: Value::Object(Default::default()),
            version: 0,
            notes: Vec::new(),
            status: status.to_string(),
        }
    }
}

/// One execution record as written by the orchestrator.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: DbId,
    pub record: NewExecutionRecord,
    /// `None` while running.
    pub outcome: Option<ExecutionOutcome>,
}

#[derive(Default)]
struct State {
    entities: HashMap<EntityRef, EntitySnapshot>,
    hosts: HashMap<DbId, HostInfo>,
    attempts: HashMap<DbId, AttemptInfo>,
    containers: HashMap<DbId, ContainerIdentity>,
    records: BTreeMap<DbId, StoredRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending host.
    pub async fn add_host(&self, host: HostInfo) {
        let mut state = self.state.lock().await;
        state.entities.insert(
            EntityRef::host(host.id),
            EntitySnapshot::new(HostStatus::Pending.name()),
        );
        state.hosts.insert(host.id, host);
    }

    /// Register a pending work attempt. Its host must be added separately.
    pub async fn add_attempt(&self, attempt: AttemptInfo) {
        let mut state = self.state.lock().await;
        state.entities.insert(
            EntityRef::attempt(attempt.id),
            EntitySnapshot::new(AttemptStatus::Pending.name()),
        );
        state.attempts.insert(attempt.id, attempt);
    }

    /// Replace an entity's bag wholesale.
    pub async fn seed_metadata(&self, entity: EntityRef, metadata: Value) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = state
            .entities
            .get_mut(&entity)
            .ok_or_else(|| not_found(entity))?;
        snapshot.metadata = metadata;
        snapshot.version += 1;
        Ok(())
    }

    pub async fn snapshot(&self, entity: EntityRef) -> Option<EntitySnapshot> {
        self.state.lock().await.entities.get(&entity).cloned()
    }

    pub async fn container(&self, attempt_id: DbId) -> Option<ContainerIdentity> {
        self.state.lock().await.containers.get(&attempt_id).cloned()
    }

    /// All records in creation order.
    pub async fn records(&self) -> Vec<StoredRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn metadata(&self, entity: EntityRef) -> PipelineResult<MetadataBag> {
        let state = self.state.lock().await;
        let snapshot = state.entities.get(&entity).ok_or_else(|| not_found(entity))?;
        Ok(MetadataBag::new(
            entity,
            snapshot.metadata.clone(),
            snapshot.version,
        ))
    }

    async fn update_metadata(
        &self,
        entity: EntityRef,
        edit: MetadataEdit,
    ) -> PipelineResult<MetadataBag> {
        let mut state = self.state.lock().await;
        let snapshot = state
            .entities
            .get_mut(&entity)
            .ok_or_else(|| not_found(entity))?;
        let mut bag = MetadataBag::new(entity, snapshot.metadata.clone(), snapshot.version);
        edit(&mut bag);
        snapshot.metadata = bag.to_value();
        snapshot.version = bag.version();
        Ok(bag)
    }

    async fn append_note(&self, entity: EntityRef, line: &str) -> PipelineResult<()> {
        if !entity.kind.supports_notes() {
            return Err(CoreError::UnsupportedEntity(entity.kind).into());
        }
        let mut state = self.state.lock().await;
        let snapshot = state
            .entities
            .get_mut(&entity)
            .ok_or_else(|| not_found(entity))?;
        snapshot.notes.push(line.to_string());
        Ok(())
    }

    async fn set_status(&self, entity: EntityRef, status: EntityStatus) -> PipelineResult<()> {
        check_status_kind(entity, status)?;
        let mut state = self.state.lock().await;
        let snapshot = state
            .entities
            .get_mut(&entity)
            .ok_or_else(|| not_found(entity))?;
        snapshot.status = status.name().to_string();
        Ok(())
    }

    async fn status_name(&self, entity: EntityRef) -> PipelineResult<String> {
        let state = self.state.lock().await;
        state
            .entities
            .get(&entity)
            .map(|snapshot| snapshot.status.clone())
            .ok_or_else(|| not_found(entity).into())
    }

    async fn host(&self, id: DbId) -> PipelineResult<HostInfo> {
        let state = self.state.lock().await;
        state
            .hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(EntityRef::host(id)).into())
    }

    async fn attempt(&self, id: DbId) -> PipelineResult<AttemptInfo> {
        let state = self.state.lock().await;
        state
            .attempts
            .get(&id)
            .copied()
            .ok_or_else(|| not_found(EntityRef::attempt(id)).into())
    }

    async fn set_container(
        &self,
        attempt_id: DbId,
        container: &ContainerIdentity,
    ) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        if !state.attempts.contains_key(&attempt_id) {
            return Err(not_found(EntityRef::attempt(attempt_id)).into());
        }
        state.containers.insert(attempt_id, container.clone());
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, record: NewExecutionRecord) -> PipelineResult<DbId> {
        let mut state = self.state.lock().await;
        let id = state.records.keys().next_back().copied().unwrap_or(0) + 1;
        state.records.insert(
            id,
            StoredRecord {
                id,
                record,
                outcome: None,
            },
        );
        Ok(id)
    }

    async fn finalize(&self, id: DbId, outcome: &ExecutionOutcome) -> PipelineResult<bool> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(&id) {
            Some(stored) if stored.outcome.is_none() => {
                stored.outcome = Some(outcome.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rigger_core::metadata::MergeMode;
    use rigger_core::scripting::target::{Credential, RemoteHost};
    use serde_json::json;

    use super::*;
    use crate::error::PipelineError;

    fn host(id: DbId) -> HostInfo {
        HostInfo {
            id,
            name: format!("web-{id}"),
            target: RemoteHost {
                address: "10.0.0.5".into(),
                port: 22,
                username: "root".into(),
                credential: Credential::Agent,
            },
        }
    }

    fn object(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn merge_bumps_version_and_persists() {
        let store = MemoryStore::new();
        store.add_host(host(1)).await;
        let entity = EntityRef::host(1);

        store
            .merge_metadata(entity, object(json!({"port": 1})), MergeMode::Overwrite)
            .await
            .unwrap();
        let bag = store.metadata(entity).await.unwrap();
        assert_eq!(bag.to_value(), json!({"port": 1}));
        assert_eq!(bag.version(), 1);
    }

    #[tokio::test]
    async fn records_finalise_once() {
        let store = MemoryStore::new();
        let id = store.create(NewExecutionRecord::default()).await.unwrap();
        let outcome = ExecutionOutcome::Errored {
            message: "boom".into(),
        };
        assert!(store.finalize(id, &outcome).await.unwrap());
        assert!(!store.finalize(id, &outcome).await.unwrap());
        assert!(!store.finalize(99, &outcome).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_status_kind_is_rejected() {
        let store = MemoryStore::new();
        store.add_host(host(1)).await;
        let err = store
            .set_status(
                EntityRef::host(1),
                EntityStatus::Attempt(AttemptStatus::Running),
            )
            .await
            .unwrap_err();
        assert_matches!(err, PipelineError::Core(CoreError::Internal(_)));
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let store = MemoryStore::new();
        assert_matches!(
            store.metadata(EntityRef::attempt(4)).await,
            Err(PipelineError::Core(CoreError::NotFound { id: 4, .. }))
        );
    }
}
