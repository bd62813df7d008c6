//! Dispatcher integration tests.
//!
//! These need a PostgreSQL server (`DATABASE_URL`); run them with
//! `cargo test -p rigger-worker -- --ignored`.

use std::sync::Arc;

use async_trait::async_trait;
use rigger_core::entity::EntityRef;
use rigger_core::scripting::executor::{ExecutionResult, ScriptError, ScriptExecutor, ScriptInput};
use rigger_core::status::{ExecutionStatus, HostStatus};
use rigger_db::models::execution::NewExecutionRecord;
use rigger_db::models::host::CreateHost;
use rigger_db::repositories::{ExecutionRecordRepo, HostRepo};
use rigger_events::EventBus;
use rigger_pipeline::context::ChainSettings;
use rigger_pipeline::pg::PgStore;
use rigger_pipeline::store::{EntityStore, ExecutionStore};
use rigger_pipeline::ChainRunner;
use rigger_worker::dispatcher::ChainDispatcher;
use serde_json::json;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Every script succeeds with empty output.
struct SucceedingExecutor;

#[async_trait]
impl ScriptExecutor for SucceedingExecutor {
    async fn execute(&self, _input: ScriptInput) -> Result<ExecutionResult, ScriptError> {
        Ok(ExecutionResult::new("ok\n".into(), String::new(), 0, 1))
    }
}

fn dispatcher(pool: &PgPool) -> ChainDispatcher {
    let store = Arc::new(PgStore::new(pool.clone()));
    let entities: Arc<dyn EntityStore> = Arc::clone(&store) as Arc<dyn EntityStore>;
    let records: Arc<dyn ExecutionStore> = store;
    let runner = ChainRunner::new(
        entities,
        records,
        Arc::new(SucceedingExecutor),
        Arc::new(EventBus::default()),
        ChainSettings::default(),
    );
    ChainDispatcher::new(pool.clone(), runner, 2)
}

async fn new_host(pool: &PgPool) -> i64 {
    named_host(pool, "web-1").await
}

async fn named_host(pool: &PgPool, name: &str) -> i64 {
    HostRepo::create(
        pool,
        &CreateHost {
            name: name.to_string(),
            address: "10.0.0.5".to_string(),
            ssh_port: None,
            username: None,
            password: None,
            identity_file: Some("/root/.ssh/id_ed25519".to_string()),
        },
    )
    .await
    .unwrap()
    .id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn pending_host_is_provisioned(pool: PgPool) {
    let host_id = new_host(&pool).await;
    let dispatcher = dispatcher(&pool);

    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 1);
    dispatcher.drain().await;

    let host = HostRepo::find_by_id(&pool, host_id).await.unwrap().unwrap();
    assert_eq!(host.status(), Some(HostStatus::Provisioned));
    assert_eq!(host.metadata["current_step"], json!("completed"));
    assert!(host.notes.unwrap().contains("provision-host completed"));

    let records = ExecutionRecordRepo::list_for_host(&pool, host_id, 50).await.unwrap();
    assert_eq!(records.len(), 6);
    assert!(records
        .iter()
        .all(|r| r.status() == Some(ExecutionStatus::Completed)));

    // Nothing left to claim.
    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn queued_script_with_unknown_template_is_failed(pool: PgPool) {
    let host_id = new_host(&pool).await;
    HostRepo::set_status(&pool, host_id, HostStatus::Provisioned).await.unwrap();
    let id = ExecutionRecordRepo::enqueue(
        &pool,
        &NewExecutionRecord {
            template: "format-disk".to_string(),
            name: "Format disk".to_string(),
            metadata: json!({"params": {}}),
            host_id: Some(host_id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(dispatcher(&pool).dispatch_once().await.unwrap(), 0);

    let record = ExecutionRecordRepo::find_by_id(&pool, id).await.unwrap().unwrap();
    assert_eq!(record.status(), Some(ExecutionStatus::Failed));
    assert!(record
        .error_output
        .unwrap()
        .contains("Script template not found: format-disk"));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn busy_entity_is_left_for_the_next_poll(pool: PgPool) {
    let host_id = new_host(&pool).await;
    let dispatcher = dispatcher(&pool);
    let guard = dispatcher.locks().try_acquire(EntityRef::host(host_id)).unwrap();

    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
    let host = HostRepo::find_by_id(&pool, host_id).await.unwrap().unwrap();
    assert!(host.claimed_at.is_none());
    assert_eq!(host.status(), Some(HostStatus::Pending));

    drop(guard);
    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 1);
    dispatcher.drain().await;
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn script_for_a_busy_host_does_not_block_other_work(pool: PgPool) {
    let busy_host = named_host(&pool, "web-1").await;
    HostRepo::set_status(&pool, busy_host, HostStatus::Provisioned).await.unwrap();
    let script_id = ExecutionRecordRepo::enqueue(
        &pool,
        &NewExecutionRecord {
            template: "update-packages".to_string(),
            name: "Update packages".to_string(),
            metadata: json!({"params": {}}),
            host_id: Some(busy_host),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let idle_host = named_host(&pool, "web-2").await;

    let dispatcher = dispatcher(&pool);
    let guard = dispatcher.locks().try_acquire(EntityRef::host(busy_host)).unwrap();

    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 1);
    dispatcher.drain().await;

    let host = HostRepo::find_by_id(&pool, idle_host).await.unwrap().unwrap();
    assert_eq!(host.status(), Some(HostStatus::Provisioned));

    // The script waits for its host and runs once the lock is free.
    let record = ExecutionRecordRepo::find_by_id(&pool, script_id).await.unwrap().unwrap();
    assert_eq!(record.status(), Some(ExecutionStatus::Pending));

    drop(guard);
    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 1);
    dispatcher.drain().await;
    let record = ExecutionRecordRepo::find_by_id(&pool, script_id).await.unwrap().unwrap();
    assert_eq!(record.status(), Some(ExecutionStatus::Completed));
}
