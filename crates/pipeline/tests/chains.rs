//! End-to-end chain runs against the in-memory store and a scripted
//! executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use rigger_core::channels::{channel_key, EVENT_WORKFLOW_COMPLETED, EVENT_WORKFLOW_FAILED};
use rigger_core::entity::EntityRef;
use rigger_core::metadata::MetadataBag;
use rigger_core::pipelines::{definitions, Pipeline};
use rigger_core::scripting::executor::{
    Delivery, ExecutionResult, ScriptError, ScriptExecutor, ScriptInput,
};
use rigger_core::scripting::target::{Credential, ExecutionTarget, RemoteHost};
use rigger_core::scripts::{ScriptJob, ScriptTask};
use rigger_core::status::{AttemptStatus, HostStatus};
use rigger_core::workflow::{project, step_history, OverallStatus, StepStatus};
use rigger_db::models::execution::{ExecutionOutcome, NewExecutionRecord};
use rigger_events::EventBus;
use rigger_pipeline::chains::{provision_workspace, run_script, FixedStep};
use rigger_pipeline::context::{ChainSettings, StatusTransitions};
use rigger_pipeline::memory::MemoryStore;
use rigger_core::error::CoreError;
use rigger_core::types::DbId;
use rigger_db::models::attempt::ContainerIdentity;
use rigger_pipeline::store::{
    AttemptInfo, EntityStatus, EntityStore, ExecutionStore, HostInfo, MetadataEdit,
};
use rigger_pipeline::PipelineResult;
use rigger_pipeline::{Chain, ChainOutcome, ChainRunner, ChainStep, StepPolicy};
use serde_json::json;

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

enum Reply {
    Exit(i32, &'static str, &'static str),
    Timeout,
    Hang,
}

/// Answers each call with the next queued reply and remembers the inputs.
#[derive(Default)]
struct ScriptedExecutor {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<ScriptInput>>,
}

impl ScriptedExecutor {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<ScriptInput> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptExecutor for ScriptedExecutor {
    async fn execute(&self, input: ScriptInput) -> Result<ExecutionResult, ScriptError> {
        self.calls.lock().unwrap().push(input);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Exit(code, stdout, stderr)) => Ok(ExecutionResult::new(
                stdout.to_string(),
                stderr.to_string(),
                code,
                3,
            )),
            Some(Reply::Timeout) => Err(ScriptError::Timeout { elapsed_ms: 810 }),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ExecutionResult::new(String::new(), String::new(), 0, 60_000))
            }
            None => Ok(ExecutionResult::new("ok\n".into(), String::new(), 0, 1)),
        }
    }
}

// ---------------------------------------------------------------------------
// Store that rejects some notes
// ---------------------------------------------------------------------------

/// Delegates to a [`MemoryStore`] but fails every note containing `fail_on`.
struct RejectingNotes {
    inner: Arc<MemoryStore>,
    fail_on: &'static str,
}

#[async_trait]
impl EntityStore for RejectingNotes {
    async fn metadata(&self, entity: EntityRef) -> PipelineResult<MetadataBag> {
        self.inner.metadata(entity).await
    }

    async fn update_metadata(
        &self,
        entity: EntityRef,
        edit: MetadataEdit,
    ) -> PipelineResult<MetadataBag> {
        self.inner.update_metadata(entity, edit).await
    }

    async fn append_note(&self, entity: EntityRef, line: &str) -> PipelineResult<()> {
        if line.contains(self.fail_on) {
            return Err(CoreError::Internal("notes column is read-only".into()).into());
        }
        self.inner.append_note(entity, line).await
    }

    async fn set_status(&self, entity: EntityRef, status: EntityStatus) -> PipelineResult<()> {
        self.inner.set_status(entity, status).await
    }

    async fn status_name(&self, entity: EntityRef) -> PipelineResult<String> {
        self.inner.status_name(entity).await
    }

    async fn host(&self, id: DbId) -> PipelineResult<HostInfo> {
        self.inner.host(id).await
    }

    async fn attempt(&self, id: DbId) -> PipelineResult<AttemptInfo> {
        self.inner.attempt(id).await
    }

    async fn set_container(
        &self,
        attempt_id: DbId,
        container: &ContainerIdentity,
    ) -> PipelineResult<()> {
        self.inner.set_container(attempt_id, container).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    executor: Arc<ScriptedExecutor>,
    runner: ChainRunner,
}

async fn harness(replies: Vec<Reply>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .add_host(HostInfo {
            id: 1,
            name: "web-1".to_string(),
            target: RemoteHost {
                address: "10.0.0.5".to_string(),
                port: 2222,
                username: "root".to_string(),
                credential: Credential::Agent,
            },
        })
        .await;
    store
        .add_attempt(AttemptInfo {
            id: 7,
            user_id: 11,
            task_id: 12,
            host_id: 1,
        })
        .await;

    let bus = Arc::new(EventBus::new(64));
    let executor = ScriptedExecutor::new(replies);
    let runner = ChainRunner::new(
        Arc::clone(&store) as Arc<dyn EntityStore>,
        Arc::clone(&store) as Arc<dyn ExecutionStore>,
        Arc::clone(&executor) as Arc<dyn ScriptExecutor>,
        Arc::clone(&bus),
        ChainSettings::default(),
    );
    Harness {
        store,
        bus,
        executor,
        runner,
    }
}

/// A runner over the harness store whose notes fail on `fail_on`.
fn rejecting_runner(h: &Harness, fail_on: &'static str) -> ChainRunner {
    let entities = Arc::new(RejectingNotes {
        inner: Arc::clone(&h.store),
        fail_on,
    });
    ChainRunner::new(
        entities as Arc<dyn EntityStore>,
        Arc::clone(&h.store) as Arc<dyn ExecutionStore>,
        Arc::clone(&h.executor) as Arc<dyn ScriptExecutor>,
        Arc::clone(&h.bus),
        ChainSettings::default(),
    )
}

fn host_transitions() -> StatusTransitions {
    StatusTransitions {
        running: Some(EntityStatus::Host(HostStatus::Provisioning)),
        completed: Some(EntityStatus::Host(HostStatus::Provisioned)),
        failed: Some(EntityStatus::Host(HostStatus::Failed)),
    }
}

/// Three fixed steps against host 1.
fn three_step_chain(policy: StepPolicy) -> Chain {
    Chain {
        pipeline: Pipeline::ProvisionHost,
        entity: EntityRef::host(1),
        steps: vec![
            ChainStep::new(
                FixedStep::new(definitions::START, ScriptJob::CheckConnection),
                policy,
            ),
            ChainStep::new(
                FixedStep::new(definitions::UPDATE_PACKAGES, ScriptJob::UpdatePackages),
                policy,
            ),
            ChainStep::new(
                FixedStep::new(definitions::INSTALL_RUNTIME, ScriptJob::InstallRuntime),
                policy,
            ),
        ],
        transitions: host_transitions(),
        preassigned_execution: None,
    }
}

async fn bag(store: &MemoryStore, entity: EntityRef) -> MetadataBag {
    store.metadata(entity).await.unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_chain_completes_every_step() {
    let h = harness(vec![]).await;
    let chain = three_step_chain(StepPolicy::default());
    let defs = chain.definitions();
    let mut events = h.bus.subscribe_channel(channel_key(EntityRef::host(1)));

    let report = h.runner.run(chain).await.unwrap();
    assert_eq!(report.outcome, ChainOutcome::Completed);

    let state = project(&defs, &bag(&h.store, EntityRef::host(1)).await);
    assert_eq!(state.status, OverallStatus::Completed);
    assert_eq!(state.current_step.as_deref(), Some("completed"));
    assert_eq!(state.workflow.as_deref(), Some("provision-host"));
    assert_eq!(state.completed_steps, 3);
    assert_eq!(state.percentage, 100);

    let history = step_history(&bag(&h.store, EntityRef::host(1)).await);
    assert_eq!(history.len(), 3);
    for (step, record) in &history {
        assert!(record.started_at.is_some(), "{step} has no started_at");
        assert!(record.completed_at.is_some(), "{step} has no completed_at");
    }

    let snapshot = h.store.snapshot(EntityRef::host(1)).await.unwrap();
    assert_eq!(snapshot.status, "provisioned");
    assert!(snapshot.notes.first().unwrap().ends_with("Starting provision-host"));
    assert!(snapshot.notes.last().unwrap().ends_with("provision-host completed"));

    let records = h.store.records().await;
    assert_eq!(records.len(), 3);
    for stored in &records {
        assert_eq!(stored.record.host_id, Some(1));
        assert_matches!(&stored.outcome, Some(ExecutionOutcome::Exited(r)) if r.successful);
    }
    assert_eq!(records[0].record.template, "check-connection");
    assert_eq!(records[0].record.metadata["step"], json!("start"));

    for call in h.executor.calls() {
        assert_matches!(call.target, ExecutionTarget::Remote(ref r) if r.port == 2222);
    }

    let mut last = None;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), events.recv()).await
    {
        last = Some(event);
    }
    let last = last.expect("events were published");
    assert_eq!(last.event, EVENT_WORKFLOW_COMPLETED);
    assert_eq!(last.payload["status"], json!("provisioned"));
    assert_eq!(last.payload["currentStep"], json!("completed"));
}

#[tokio::test]
async fn failing_step_halts_the_chain() {
    let h = harness(vec![
        Reply::Exit(0, "os=debian version=12\n", ""),
        Reply::Exit(1, "", "disk full"),
    ])
    .await;
    let chain = three_step_chain(StepPolicy::default());
    let defs = chain.definitions();

    let report = h.runner.run(chain).await.unwrap();
    assert_matches!(
        report.outcome,
        ChainOutcome::Failed { ref step, ref reason }
            if step == "update-packages" && reason.contains("disk full")
    );

    // The third script never ran.
    assert_eq!(h.executor.calls().len(), 2);

    let state = project(&defs, &bag(&h.store, EntityRef::host(1)).await);
    assert_eq!(state.status, OverallStatus::Failed);
    assert_eq!(
        state.step("update-packages").unwrap().record.status,
        StepStatus::Failed
    );
    assert!(state
        .step("update-packages")
        .unwrap()
        .record
        .error_message
        .as_deref()
        .unwrap()
        .contains("disk full"));
    assert_eq!(
        state.step("install-runtime").unwrap().record.status,
        StepStatus::NotStarted
    );
    assert_eq!(state.percentage, 33);
    let history = step_history(&bag(&h.store, EntityRef::host(1)).await);
    assert!(!history.contains_key("install-runtime"));

    let snapshot = h.store.snapshot(EntityRef::host(1)).await.unwrap();
    assert_eq!(snapshot.status, "failed");
    assert!(snapshot
        .notes
        .iter()
        .any(|n| n.contains("Update packages failed:") && n.contains("disk full")));

    let records = h.store.records().await;
    assert_eq!(records.len(), 2);
    assert_matches!(&records[1].outcome, Some(ExecutionOutcome::Exited(r)) if r.exit_code == 1);
}

#[tokio::test]
async fn engine_timeout_terminates_the_record() {
    let h = harness(vec![Reply::Timeout]).await;
    let report = h
        .runner
        .run(three_step_chain(StepPolicy::default()))
        .await
        .unwrap();
    assert_matches!(report.outcome, ChainOutcome::Failed { ref step, .. } if step == "start");

    let records = h.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].outcome,
        Some(ExecutionOutcome::TimedOut { elapsed_ms: 810 })
    );
}

#[tokio::test]
async fn step_timeout_abandons_the_script_and_fails_the_entity() {
    let h = harness(vec![Reply::Hang]).await;
    let chain = three_step_chain(StepPolicy::with_timeout(Duration::from_millis(100)));
    let defs = chain.definitions();

    let mut events = h.bus.subscribe_channel(channel_key(EntityRef::host(1)));
    let report = h.runner.run(chain).await.unwrap();
    assert_matches!(
        report.outcome,
        ChainOutcome::Failed { ref step, ref reason }
            if step == "start" && reason.contains("timeout")
    );

    let records = h.store.records().await;
    assert_eq!(records.len(), 1);
    assert_matches!(&records[0].outcome, Some(ExecutionOutcome::Errored { .. }));

    let snapshot = h.store.snapshot(EntityRef::host(1)).await.unwrap();
    assert_eq!(snapshot.status, "failed");
    let state = project(&defs, &bag(&h.store, EntityRef::host(1)).await);
    assert_eq!(state.status, OverallStatus::Failed);
    assert_eq!(state.step("start").unwrap().record.status, StepStatus::Failed);

    let mut saw_failed = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), events.recv()).await
    {
        saw_failed |= event.event == EVENT_WORKFLOW_FAILED;
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn aborted_step_is_retried_while_tries_remain() {
    let h = harness(vec![Reply::Hang]).await;
    let policy = StepPolicy {
        timeout: Duration::from_millis(100),
        tries: 2,
    };
    let report = h.runner.run(three_step_chain(policy)).await.unwrap();
    assert_eq!(report.outcome, ChainOutcome::Completed);

    // The hung try was finalised before the retry created its own record.
    let records = h.store.records().await;
    assert_eq!(records.len(), 4);
    assert_matches!(&records[0].outcome, Some(ExecutionOutcome::Errored { .. }));
    assert_matches!(&records[1].outcome, Some(ExecutionOutcome::Exited(_)));
}

#[tokio::test]
async fn bookkeeping_error_after_start_marks_the_entity_failed() {
    let h = harness(vec![]).await;
    let runner = rejecting_runner(&h, "Starting");
    let mut events = h.bus.subscribe_channel(channel_key(EntityRef::host(1)));

    assert!(runner.run(three_step_chain(StepPolicy::default())).await.is_err());
    assert!(h.executor.calls().is_empty());

    let snapshot = h.store.snapshot(EntityRef::host(1)).await.unwrap();
    assert_eq!(snapshot.status, "failed");
    assert_eq!(snapshot.metadata["current_step"], json!("failed"));
    assert!(snapshot
        .notes
        .iter()
        .any(|n| n.contains("provision-host failed:") && n.contains("read-only")));

    let mut saw_failed = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), events.recv()).await
    {
        saw_failed |= event.event == EVENT_WORKFLOW_FAILED;
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn abort_after_the_record_is_final_is_not_retried() {
    let h = harness(vec![Reply::Exit(1, "", "unreachable")]).await;
    let runner = rejecting_runner(&h, "Connect failed");
    let policy = StepPolicy {
        tries: 2,
        ..StepPolicy::default()
    };

    let report = runner.run(three_step_chain(policy)).await.unwrap();
    assert_matches!(report.outcome, ChainOutcome::Failed { ref step, .. } if step == "start");

    // One script, one record: the failed try is not repeated.
    assert_eq!(h.executor.calls().len(), 1);
    let records = h.store.records().await;
    assert_eq!(records.len(), 1);
    assert_matches!(&records[0].outcome, Some(ExecutionOutcome::Exited(r)) if r.exit_code == 1);

    let snapshot = h.store.snapshot(EntityRef::host(1)).await.unwrap();
    assert_eq!(snapshot.status, "failed");
}

#[tokio::test]
async fn rerun_replaces_the_previous_workflow_view() {
    let h = harness(vec![Reply::Exit(1, "", "disk full")]).await;
    let report = h
        .runner
        .run(three_step_chain(StepPolicy::default()))
        .await
        .unwrap();
    assert_matches!(report.outcome, ChainOutcome::Failed { .. });

    let chain = three_step_chain(StepPolicy::default());
    let defs = chain.definitions();
    let report = h.runner.run(chain).await.unwrap();
    assert_eq!(report.outcome, ChainOutcome::Completed);

    let current = bag(&h.store, EntityRef::host(1)).await;
    let state = project(&defs, &current);
    assert_eq!(state.status, OverallStatus::Completed);
    assert!(state.steps.iter().all(|s| s.record.error_message.is_none()));

    // Projection is a pure read.
    assert_eq!(project(&defs, &current), state);
}

#[tokio::test]
async fn workspace_chain_records_container_and_marks_attempt_running() {
    let h = harness(vec![
        Reply::Exit(0, "user ws-7 ready\n", ""),
        Reply::Exit(
            0,
            "__FREE_PORT_START__\n{\"port\": 20007}\n__FREE_PORT_END__\n",
            "",
        ),
        Reply::Exit(0, "wrote ws-7 compose file\n", ""),
        Reply::Exit(
            0,
            concat!(
                "__DOCKER_PS_START__\n",
                "{\"ID\":\"abc123\",\"Name\":\"ws-7\",\"State\":\"running\",",
                "\"Publishers\":[{\"TargetPort\":8080,\"PublishedPort\":20007}]}\n",
                "__DOCKER_PS_END__\n",
            ),
            "",
        ),
    ])
    .await;
    let chain = provision_workspace(7, h.runner.settings());
    let defs = chain.definitions();

    let report = h.runner.run(chain).await.unwrap();
    assert_eq!(report.outcome, ChainOutcome::Completed);

    let snapshot = h.store.snapshot(EntityRef::attempt(7)).await.unwrap();
    assert_eq!(snapshot.status, AttemptStatus::Running.name());
    assert_eq!(snapshot.metadata["username"], json!("ws-7"));
    assert_eq!(snapshot.metadata["host_port"], json!(20007));
    assert_eq!(snapshot.metadata["container_id"], json!("abc123"));

    let container = h.store.container(7).await.unwrap();
    assert_eq!(container.container_name, "ws-7");
    assert_eq!(container.container_port, Some(20007));

    let state = project(&defs, &bag(&h.store, EntityRef::attempt(7)).await);
    assert_eq!(state.percentage, 100);

    let records = h.store.records().await;
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.record.attempt_id == Some(7)
        && r.record.user_id == Some(11)
        && r.record.task_id == Some(12)
        && r.record.host_id == Some(1)));

    let calls = h.executor.calls();
    assert_eq!(calls[2].delivery, Delivery::Stdin);
    assert!(calls[2].script.contains("\"20007:8080\""));
}

#[tokio::test]
async fn missing_metadata_fails_before_any_script_runs() {
    let h = harness(vec![]).await;
    let mut chain = provision_workspace(7, h.runner.settings());
    // Start at write-compose-config with an empty bag.
    chain.steps = chain.steps.split_off(2);

    let report = h.runner.run(chain).await.unwrap();
    assert_matches!(
        report.outcome,
        ChainOutcome::Failed { ref step, ref reason }
            if step == "write-compose-config" && reason.contains("'workdir'")
    );
    assert!(h.executor.calls().is_empty());
    assert!(h.store.records().await.is_empty());

    let snapshot = h.store.snapshot(EntityRef::attempt(7)).await.unwrap();
    assert_eq!(snapshot.status, AttemptStatus::Failed.name());
}

#[tokio::test]
async fn unusable_output_rejects_a_successful_script() {
    let h = harness(vec![
        Reply::Exit(0, "user ws-7 ready\n", ""),
        Reply::Exit(0, "no markers here\n", "warning: slow\n"),
    ])
    .await;
    let report = h
        .runner
        .run(provision_workspace(7, h.runner.settings()))
        .await
        .unwrap();
    assert_matches!(
        report.outcome,
        ChainOutcome::Failed { ref step, .. } if step == "find-free-port"
    );

    let records = h.store.records().await;
    assert_matches!(
        &records[1].outcome,
        Some(ExecutionOutcome::Rejected { reason, .. }) if reason.contains("no free port reported")
    );
}

#[tokio::test]
async fn run_script_uses_the_queued_record_and_keeps_host_status() {
    let h = harness(vec![Reply::Exit(0, "updated\n", "")]).await;
    let queued = h
        .store
        .create(NewExecutionRecord {
            template: "update-packages".to_string(),
            name: "Update packages".to_string(),
            script: "apt-get update -y\n".to_string(),
            metadata: json!({"params": null}),
            host_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    let task = ScriptTask::new(ScriptJob::UpdatePackages);
    let chain = run_script(1, task, Some(queued), h.runner.settings());
    let report = h.runner.run(chain).await.unwrap();
    assert_eq!(report.outcome, ChainOutcome::Completed);

    let records = h.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, queued);
    assert_matches!(&records[0].outcome, Some(ExecutionOutcome::Exited(r)) if r.output == "updated\n");

    let snapshot = h.store.snapshot(EntityRef::host(1)).await.unwrap();
    assert_eq!(snapshot.status, HostStatus::Pending.name());
    assert_eq!(snapshot.metadata["workflow"], json!("run-script"));
    assert_eq!(
        snapshot.metadata["last_script"]["template"],
        json!("update-packages")
    );
}

#[tokio::test]
async fn already_final_queued_record_keeps_its_outcome() {
    let h = harness(vec![Reply::Exit(0, "updated\n", "")]).await;
    let queued = h
        .store
        .create(NewExecutionRecord {
            template: "update-packages".to_string(),
            name: "Update packages".to_string(),
            script: "apt-get update -y\n".to_string(),
            host_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    let cancelled = ExecutionOutcome::Errored {
        message: "cancelled by operator".to_string(),
    };
    assert!(h.store.finalize(queued, &cancelled).await.unwrap());

    let task = ScriptTask::new(ScriptJob::UpdatePackages);
    let report = h
        .runner
        .run(run_script(1, task, Some(queued), h.runner.settings()))
        .await
        .unwrap();
    assert_eq!(report.outcome, ChainOutcome::Completed);

    let records = h.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Some(cancelled));
}

#[tokio::test]
async fn chains_cannot_target_execution_records() {
    let h = harness(vec![]).await;
    let mut chain = three_step_chain(StepPolicy::default());
    chain.entity = EntityRef::execution(1);
    assert!(h.runner.run(chain).await.is_err());
}
