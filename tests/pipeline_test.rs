//! Router and tracker driven end to end against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use swf_monitor::broadcast::{Broadcaster, SubscriptionFilter};
use swf_monitor::error::{Error, Result};
use swf_monitor::model::*;
use swf_monitor::router::{DiscardReason, MessageRouter, RouteOutcome};
use swf_monitor::store::{
    AgentStore, EventFilter, EventStore, MemoryStore, WorkflowFilter, WorkflowStore,
};
use swf_monitor::tracker::TrackOutcome;

const TOPIC: &str = "/topic/epictopic";
const FILE: &str = "run100010_0001.stf";

struct Harness {
    store: Arc<MemoryStore>,
    broadcaster: Broadcaster,
    router: MessageRouter,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Broadcaster::new(100);
    let router = MessageRouter::new(store.clone(), broadcaster.clone());
    Harness {
        store,
        broadcaster,
        router,
    }
}

impl Harness {
    async fn send(&self, body: Value) -> RouteOutcome {
        self.router.handle_body(TOPIC, &body.to_string()).await
    }

    async fn send_tracked(&self, body: Value) -> TrackOutcome {
        match self.send(body).await {
            RouteOutcome::Pipeline {
                record_id: Some(_),
                outcome: Some(outcome),
            } => outcome,
            other => panic!("expected a tracked pipeline event, got {other:?}"),
        }
    }

    async fn generate(&self) -> Workflow {
        match self
            .send_tracked(json!({
                "msg_type": "stf_gen",
                "filename": FILE,
                "run_id": "100010",
                "state": "physics",
                "substate": "run",
                "start": "20250801120000",
                "end": "20250801120002",
            }))
            .await
        {
            TrackOutcome::Created { workflow } => *workflow,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    async fn events(&self) -> Vec<EventRecord> {
        self.store.list_events(&EventFilter::default()).await.unwrap()
    }
}

fn stage_of(stages: &[Stage], category: AgentCategory) -> Vec<&Stage> {
    stages
        .iter()
        .filter(|s| s.agent_category == category)
        .collect()
}

#[tokio::test]
async fn generation_then_data_ready_scenario() {
    let h = harness();

    let workflow = h.generate().await;
    assert_eq!(workflow.status, WorkflowStatus::Generated);
    assert_eq!(workflow.filename, FILE);
    assert_eq!(workflow.run_id.as_deref(), Some("100010"));
    assert_eq!(workflow.daq_state.as_deref(), Some("physics"));
    assert_eq!(workflow.daq_substate.as_deref(), Some("run"));
    assert!(workflow.stf_start.is_some());

    let events = h.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sender_category, AgentCategory::Simulator);
    assert_eq!(events[0].sender_name, "daq-simulator");
    assert_eq!(events[0].recipient_category, AgentCategory::Data);
    assert_eq!(events[0].workflow_id, Some(workflow.id));
    assert!(events[0].is_successful);

    let outcome = h
        .send_tracked(json!({
            "msg_type": "data_ready",
            "filename": FILE,
            "workflow_id": workflow.id.to_string(),
        }))
        .await;
    match outcome {
        TrackOutcome::Advanced { from, to, .. } => {
            assert_eq!(from, WorkflowStatus::Generated);
            assert_eq!(to, WorkflowStatus::DataComplete);
        }
        other => panic!("expected Advanced, got {other:?}"),
    }

    let updated = h.store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(updated.status, WorkflowStatus::DataComplete);
    assert_eq!(updated.current_agent, AgentCategory::Processing);

    let stages = h.store.list_stages(workflow.id).await.unwrap();
    let data = stage_of(&stages, AgentCategory::Data);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].status, StageStatus::Complete);
    assert_eq!(data[0].agent_name.as_deref(), Some("data-agent"));
    assert!(data[0].elapsed().unwrap() >= chrono::Duration::zero());

    // The receiving stage is open but nobody has claimed it yet.
    let processing = stage_of(&stages, AgentCategory::Processing);
    assert_eq!(processing.len(), 1);
    assert!(processing[0].is_open());
    assert!(!processing[0].is_claimed());

    let latest = &h.events().await[0];
    assert_eq!(latest.msg_type, "data_ready");
    assert_eq!(latest.stage_id, Some(data[0].id));
}

#[tokio::test]
async fn full_pipeline_reaches_workflow_complete() {
    let h = harness();
    let workflow = h.generate().await;

    let steps = [
        ("data_received", Some("data-agent-1"), WorkflowStatus::DataReceived),
        ("data_processing", Some("data-agent-1"), WorkflowStatus::DataProcessing),
        ("data_ready", Some("data-agent-1"), WorkflowStatus::DataComplete),
        ("processing_received", Some("processing-1"), WorkflowStatus::ProcessingReceived),
        ("processing_started", Some("processing-1"), WorkflowStatus::ProcessingProcessing),
        ("processing_complete", Some("processing-1"), WorkflowStatus::ProcessingComplete),
        ("fastmon_received", None, WorkflowStatus::FastmonReceived),
        ("fastmon_complete", None, WorkflowStatus::WorkflowComplete),
    ];

    for (msg_type, agent, expected) in steps {
        let mut body = json!({"msg_type": msg_type, "filename": FILE, "run_id": "100010"});
        if let Some(agent) = agent {
            body["processed_by"] = json!(agent);
        }
        let outcome = h.send_tracked(body).await;
        assert!(outcome.is_successful(), "{msg_type}: {outcome:?}");
        let current = h.store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(current.status, expected, "after {msg_type}");
    }

    let done = h.store.get_workflow(workflow.id).await.unwrap();
    assert!(done.completed_at.is_some());

    let stages = h.store.list_stages(workflow.id).await.unwrap();
    assert_eq!(stages.len(), 3);
    for stage in &stages {
        assert_eq!(stage.status, StageStatus::Complete);
        assert!(stage.elapsed().unwrap() >= chrono::Duration::zero());
    }

    for (name, category) in [
        ("data-agent-1", AgentCategory::Data),
        ("processing-1", AgentCategory::Processing),
        ("fastmon-agent", AgentCategory::FastMonitor),
    ] {
        let agent = h.store.get_agent(name).await.unwrap();
        assert_eq!(agent.category, category, "{name}");
        assert_eq!(agent.in_flight, 0, "{name}");
        assert_eq!(agent.processed_total, 1, "{name}");
        assert!(agent.last_completed_at.is_some(), "{name}");
    }

    assert_eq!(h.store.event_count(), 9);
    assert!(h.events().await.iter().all(|e| e.is_successful));
}

#[tokio::test]
async fn duplicate_generation_keeps_one_workflow() {
    let h = harness();
    let first = h.generate().await;

    let outcome = h
        .send_tracked(json!({"msg_type": "stf_gen", "filename": FILE, "run_id": "100010"}))
        .await;
    match outcome {
        TrackOutcome::Duplicate { workflow_id } => assert_eq!(workflow_id, first.id),
        other => panic!("expected Duplicate, got {other:?}"),
    }

    assert_eq!(h.store.workflow_count(), 1);
    let events = h.events().await;
    assert_eq!(events.len(), 2);
    assert!(!events[0].is_successful);
    assert_eq!(events[0].workflow_id, Some(first.id));
}

// Only generation is deduplicated. A repeated hand-off is applied again:
// it records a second visit for the sending category and counts it as a
// second completed stage. Kept deliberately; this test pins it down.
#[tokio::test]
async fn duplicate_hand_off_is_applied_twice() {
    let h = harness();
    let workflow = h.generate().await;

    let body = json!({
        "msg_type": "processing_complete",
        "filename": FILE,
        "processed_by": "processing-1",
    });
    h.send_tracked(body.clone()).await;
    let again = h.send_tracked(body).await;

    match again {
        TrackOutcome::Advanced { from, to, .. } => {
            assert_eq!(from, WorkflowStatus::ProcessingComplete);
            assert_eq!(to, WorkflowStatus::ProcessingComplete);
        }
        other => panic!("expected the duplicate to be applied, got {other:?}"),
    }

    let stages = h.store.list_stages(workflow.id).await.unwrap();
    assert_eq!(stage_of(&stages, AgentCategory::Processing).len(), 2);
    assert_eq!(stage_of(&stages, AgentCategory::FastMonitor).len(), 1);

    let agent = h.store.get_agent("processing-1").await.unwrap();
    assert_eq!(agent.processed_total, 2);
    assert_eq!(agent.in_flight, 0);
}

#[tokio::test]
async fn backwards_report_is_rejected_without_mutation() {
    let h = harness();
    let workflow = h.generate().await;
    h.send_tracked(json!({"msg_type": "data_ready", "filename": FILE}))
        .await;
    let stages_before = h.store.list_stages(workflow.id).await.unwrap().len();

    let outcome = h
        .send_tracked(json!({"msg_type": "data_received", "filename": FILE}))
        .await;
    assert!(matches!(
        outcome,
        TrackOutcome::Rejected {
            from: WorkflowStatus::DataComplete,
            to: WorkflowStatus::DataReceived,
            ..
        }
    ));

    let current = h.store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(current.status, WorkflowStatus::DataComplete);
    assert_eq!(
        h.store.list_stages(workflow.id).await.unwrap().len(),
        stages_before
    );
    assert!(!h.events().await[0].is_successful);
}

#[tokio::test]
async fn failure_is_terminal() {
    let h = harness();
    let workflow = h.generate().await;

    let failed = h
        .send_tracked(json!({"msg_type": "workflow_failed", "workflow_id": workflow.id.to_string()}))
        .await;
    assert!(matches!(
        failed,
        TrackOutcome::Advanced {
            to: WorkflowStatus::Failed,
            ..
        }
    ));

    let late = h
        .send_tracked(json!({"msg_type": "data_received", "filename": FILE}))
        .await;
    assert!(matches!(late, TrackOutcome::Rejected { .. }));
    let current = h.store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(current.status, WorkflowStatus::Failed);
    assert!(current.completed_at.is_some());
}

#[tokio::test]
async fn unmatched_events_are_still_recorded() {
    let h = harness();
    let outcome = h
        .send_tracked(json!({"msg_type": "data_ready", "filename": "never-generated.stf"}))
        .await;
    assert!(matches!(outcome, TrackOutcome::Unrelated));

    let events = h.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].workflow_id, None);
    assert_eq!(h.store.workflow_count(), 0);

    let run = h
        .send_tracked(json!({"msg_type": "start_run", "run_id": "100010"}))
        .await;
    assert!(matches!(run, TrackOutcome::Unrelated));
    assert_eq!(h.store.event_count(), 2);
}

#[tokio::test]
async fn malformed_payloads_create_no_records() {
    let h = harness();

    let not_json = h.router.handle_body(TOPIC, "{not json").await;
    assert!(matches!(not_json, RouteOutcome::Discarded(DiscardReason::Malformed)));

    let not_object = h.send(json!(["stf_gen"])).await;
    assert!(matches!(not_object, RouteOutcome::Discarded(DiscardReason::Malformed)));

    let unclassified = h.send(json!({"filename": FILE})).await;
    assert!(matches!(
        unclassified,
        RouteOutcome::Discarded(DiscardReason::Unclassified)
    ));

    assert_eq!(h.store.workflow_count(), 0);
    assert_eq!(h.store.event_count(), 0);
    assert_eq!(h.store.agent_count(), 0);
}

#[tokio::test]
async fn heartbeats_upsert_a_single_unknown_agent() {
    let h = harness();

    let first = h
        .send(json!({"agent_name": "fastmon-1", "status": "OK", "timestamp": "2025-08-01T12:00:00Z"}))
        .await;
    assert!(matches!(
        first,
        RouteOutcome::Heartbeat {
            outcome: Some(HeartbeatOutcome::Created),
            ..
        }
    ));

    let second = h
        .send(json!({"agent_name": "fastmon-1", "status": "ERROR"}))
        .await;
    assert!(matches!(
        second,
        RouteOutcome::Heartbeat {
            outcome: Some(HeartbeatOutcome::Updated),
            ..
        }
    ));

    // A null status still refreshes liveness and keeps the last status.
    let third = h
        .send(json!({"agent_name": "fastmon-1", "status": null, "timestamp": "2025-08-01T12:05:00Z"}))
        .await;
    assert!(matches!(
        third,
        RouteOutcome::Heartbeat {
            outcome: Some(HeartbeatOutcome::Updated),
            ..
        }
    ));

    assert_eq!(h.store.agent_count(), 1);
    let agent = h.store.get_agent("fastmon-1").await.unwrap();
    assert_eq!(agent.category, AgentCategory::Unknown);
    assert_eq!(agent.status, AgentStatus::Error);
    assert_eq!(
        agent.last_heartbeat.map(|t| t.to_rfc3339()),
        Some("2025-08-01T12:05:00+00:00".to_string())
    );
    assert_eq!(h.store.event_count(), 0);
}

#[tokio::test]
async fn pipeline_events_reach_subscribers_heartbeats_do_not() {
    let h = harness();
    let guard = h.broadcaster.attach(SubscriptionFilter::default());
    let subscription = guard.subscription().clone();

    h.send(json!({"agent_name": "data-agent-1", "status": "OK"}))
        .await;
    let workflow = h.generate().await;

    let event = subscription
        .recv_timeout(Duration::from_millis(100))
        .await
        .expect("stf_gen broadcast");
    assert_eq!(event.msg_type, "stf_gen");
    assert_eq!(event.agent.as_deref(), Some("daq-simulator"));
    assert_eq!(event.run_id.as_deref(), Some("100010"));
    assert_eq!(event.workflow_id, Some(workflow.id.to_string()));
    assert_eq!(subscription.queued(), 0);
    assert_eq!(subscription.delivered(), 1);
}

#[tokio::test]
async fn explicit_sender_is_registered_with_its_category() {
    let h = harness();
    h.generate().await;
    h.send_tracked(json!({"msg_type": "data_ready", "filename": FILE, "processed_by": "data-agent-7"}))
        .await;

    let agent = h.store.get_agent("data-agent-7").await.unwrap();
    assert_eq!(agent.category, AgentCategory::Data);
    assert_eq!(agent.processed_total, 1);
    assert_eq!(agent.in_flight, 0);

    // Inferred senders are not registered until they do work.
    assert!(h.store.get_agent("daq-simulator").await.is_err());
}

#[tokio::test]
async fn finished_workflow_ignores_repeated_completion() {
    let h = harness();
    let workflow = h.generate().await;
    for msg_type in ["data_ready", "processing_complete", "fastmon_complete"] {
        let outcome = h
            .send_tracked(json!({"msg_type": msg_type, "filename": FILE}))
            .await;
        assert!(outcome.is_successful(), "{msg_type}: {outcome:?}");
    }
    let before = h.store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(before.status, WorkflowStatus::WorkflowComplete);
    let stages_before = h.store.list_stages(workflow.id).await.unwrap().len();
    let processed_before = h.store.get_agent("fastmon-agent").await.unwrap().processed_total;

    let again = h
        .send_tracked(json!({"msg_type": "fastmon_complete", "filename": FILE}))
        .await;
    assert!(matches!(
        again,
        TrackOutcome::Rejected {
            from: WorkflowStatus::WorkflowComplete,
            to: WorkflowStatus::WorkflowComplete,
            ..
        }
    ));

    let after = h.store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(after.status, WorkflowStatus::WorkflowComplete);
    assert_eq!(after.completed_at, before.completed_at);
    let stages = h.store.list_stages(workflow.id).await.unwrap();
    assert_eq!(stages.len(), stages_before);
    assert_eq!(stage_of(&stages, AgentCategory::FastMonitor).len(), 1);
    let fastmon = h.store.get_agent("fastmon-agent").await.unwrap();
    assert_eq!(fastmon.processed_total, processed_before);
    assert_eq!(fastmon.in_flight, 0);
    assert!(!h.events().await[0].is_successful);
}

/// Memory store whose next `append_event` calls fail.
struct FlakyEvents {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyEvents {
    fn failing(times: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(times),
        }
    }
}

#[async_trait]
impl AgentStore for FlakyEvents {
    async fn record_heartbeat(
        &self,
        name: &str,
        status: Option<AgentStatus>,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome> {
        self.inner.record_heartbeat(name, status, at).await
    }

    async fn ensure_agent(&self, name: &str, category: AgentCategory) -> Result<()> {
        self.inner.ensure_agent(name, category).await
    }

    async fn record_stage_claimed(&self, name: &str, category: AgentCategory) -> Result<()> {
        self.inner.record_stage_claimed(name, category).await
    }

    async fn record_stage_completed(
        &self,
        name: &str,
        category: AgentCategory,
        claimed: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .record_stage_completed(name, category, claimed, at)
            .await
    }

    async fn get_agent(&self, name: &str) -> Result<Agent> {
        self.inner.get_agent(name).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.inner.list_agents().await
    }
}

#[async_trait]
impl WorkflowStore for FlakyEvents {
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertWorkflow> {
        self.inner.insert_workflow(new).await
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.inner.get_workflow(id).await
    }

    async fn find_workflow_by_filename(&self, filename: &str) -> Result<Option<Workflow>> {
        self.inner.find_workflow_by_filename(filename).await
    }

    async fn transition_workflow(
        &self,
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        current_agent: AgentCategory,
        at: DateTime<Utc>,
    ) -> Result<Workflow> {
        self.inner
            .transition_workflow(id, from, to, current_agent, at)
            .await
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        self.inner.list_workflows(filter).await
    }

    async fn open_stage(
        &self,
        workflow_id: WorkflowId,
        category: AgentCategory,
    ) -> Result<Option<Stage>> {
        self.inner.open_stage(workflow_id, category).await
    }

    async fn insert_stage(&self, new: NewStage) -> Result<Stage> {
        self.inner.insert_stage(new).await
    }

    async fn save_stage(&self, stage: &Stage) -> Result<()> {
        self.inner.save_stage(stage).await
    }

    async fn list_stages(&self, workflow_id: WorkflowId) -> Result<Vec<Stage>> {
        self.inner.list_stages(workflow_id).await
    }
}

#[async_trait]
impl EventStore for FlakyEvents {
    async fn append_event(&self, new: NewEventRecord) -> Result<EventRecord> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Other("event log unavailable".to_string()));
        }
        self.inner.append_event(new).await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        self.inner.list_events(filter).await
    }
}

#[tokio::test]
async fn failed_event_write_does_not_block_later_messages() {
    let store = Arc::new(FlakyEvents::failing(1));
    let router = MessageRouter::new(store.clone(), Broadcaster::new(10));

    let first = router
        .handle_body(
            TOPIC,
            &json!({"msg_type": "stf_gen", "filename": "run100010_0001.stf"}).to_string(),
        )
        .await;
    assert!(matches!(
        first,
        RouteOutcome::Pipeline {
            record_id: None,
            outcome: Some(TrackOutcome::Created { .. }),
        }
    ));

    let second = router
        .handle_body(
            TOPIC,
            &json!({"msg_type": "stf_gen", "filename": "run100010_0002.stf"}).to_string(),
        )
        .await;
    assert!(matches!(
        second,
        RouteOutcome::Pipeline {
            record_id: Some(_),
            outcome: Some(TrackOutcome::Created { .. }),
        }
    ));

    assert_eq!(store.inner.workflow_count(), 2);
    assert_eq!(store.inner.event_count(), 1);
    let events = store.list_events(&EventFilter::default()).await.unwrap();
    assert_eq!(events[0].payload["filename"], "run100010_0002.stf");
}
