//! Message router: the broker connection's callback target.
//!
//! Classifies each inbound body as a heartbeat or a pipeline event and
//! persists it. Every write is best-effort; a failure is logged with the
//! payload and the next write still runs. Nothing is retried.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{Instrument, debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::broker::FrameHandler;
use crate::event::{EventSource, MonitorEvent};
use crate::model::message::field_str;
use crate::model::*;
use crate::store::Store;
use crate::telemetry::{self, metrics};
use crate::tracker::{TrackOutcome, WorkflowTracker};

/// Why an inbound body was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not JSON, or not a JSON object.
    Malformed,
    /// Neither a heartbeat nor a pipeline event.
    Unclassified,
}

impl DiscardReason {
    fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Malformed => "malformed",
            DiscardReason::Unclassified => "unclassified",
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum RouteOutcome {
    Discarded(DiscardReason),
    Heartbeat {
        agent: String,
        /// `None` if the upsert failed.
        outcome: Option<HeartbeatOutcome>,
    },
    Pipeline {
        /// `None` if the event record could not be written.
        record_id: Option<i64>,
        /// `None` if the tracker failed.
        outcome: Option<TrackOutcome>,
    },
}

/// What an inbound JSON object turned out to be.
#[derive(Debug)]
pub enum Classified {
    Heartbeat(Heartbeat),
    Pipeline(Box<PipelineEvent>),
}

/// Classify a parsed body. An event-type marker wins over identity+status.
pub fn classify(payload: Value, destination: &str) -> Result<Classified, DiscardReason> {
    if !payload.is_object() {
        return Err(DiscardReason::Malformed);
    }

    if let Some(raw_type) = field_str(&payload, "msg_type") {
        return Ok(Classified::Pipeline(Box::new(enrich(
            MsgType::parse(&raw_type),
            payload,
            destination,
        ))));
    }

    // A status key marks a heartbeat even when its value is empty.
    match field_str(&payload, "agent_name") {
        Some(agent_name) if payload.get("status").is_some() => {
            Ok(Classified::Heartbeat(Heartbeat {
                agent_name,
                status: field_str(&payload, "status")
                    .as_deref()
                    .map(AgentStatus::from_report),
                reported_at: field_str(&payload, "timestamp")
                    .as_deref()
                    .and_then(parse_rfc3339),
            }))
        }
        _ => Err(DiscardReason::Unclassified),
    }
}

/// Fill in sender and recipient from the message-type table.
///
/// A `processed_by` (or `agent_name`) field names the sending instance; the
/// category always comes from the table.
fn enrich(msg_type: MsgType, payload: Value, destination: &str) -> PipelineEvent {
    let route = msg_type.route();
    let explicit = field_str(&payload, "processed_by").or_else(|| field_str(&payload, "agent_name"));
    let sender = Party {
        name: explicit
            .clone()
            .unwrap_or_else(|| route.sender.name.to_string()),
        category: route.sender.category,
    };
    PipelineEvent {
        workflow_id: field_str(&payload, "workflow_id"),
        run_id: field_str(&payload, "run_id"),
        filename: field_str(&payload, "filename"),
        sender,
        sender_explicit: explicit.is_some(),
        recipient: route.recipient.into(),
        msg_type,
        payload,
        topic: destination.to_string(),
        received_at: Utc::now(),
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Routes inbound bodies into the store and on to the broadcaster.
pub struct MessageRouter {
    store: Arc<dyn Store>,
    tracker: WorkflowTracker,
    broadcaster: Broadcaster,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn Store>, broadcaster: Broadcaster) -> Self {
        Self {
            tracker: WorkflowTracker::new(store.clone()),
            store,
            broadcaster,
        }
    }

    /// Handle one raw message body received on `destination`.
    pub async fn handle_body(&self, destination: &str, body: &str) -> RouteOutcome {
        let span = telemetry::message::start_message_span(destination);
        self.route(destination, body, &span).instrument(span.clone()).await
    }

    async fn route(&self, destination: &str, body: &str, span: &tracing::Span) -> RouteOutcome {
        let payload: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                warn!(destination, error = %e, body, "discarding malformed message");
                return discard(DiscardReason::Malformed);
            }
        };

        match classify(payload, destination) {
            Ok(Classified::Heartbeat(heartbeat)) => {
                span.record("msg.kind", "heartbeat");
                metrics::messages_received().add(1, &[KeyValue::new("kind", "heartbeat")]);
                self.heartbeat(heartbeat).await
            }
            Ok(Classified::Pipeline(event)) => {
                span.record("msg.kind", "pipeline");
                span.record("msg.type", event.msg_type.as_str());
                metrics::messages_received().add(1, &[KeyValue::new("kind", "pipeline")]);
                self.pipeline(*event, span).await
            }
            Err(DiscardReason::Malformed) => {
                warn!(destination, body, "discarding non-object message");
                discard(DiscardReason::Malformed)
            }
            Err(DiscardReason::Unclassified) => {
                debug!(destination, body, "discarding unclassified message");
                discard(DiscardReason::Unclassified)
            }
        }
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> RouteOutcome {
        let at = heartbeat.reported_at.unwrap_or_else(Utc::now);
        let outcome = match self
            .store
            .record_heartbeat(&heartbeat.agent_name, heartbeat.status, at)
            .await
        {
            Ok(outcome) => {
                if outcome == HeartbeatOutcome::Created {
                    info!(agent = %heartbeat.agent_name, "new agent registered from heartbeat");
                } else {
                    debug!(
                        agent = %heartbeat.agent_name,
                        status = heartbeat.status.map_or("unchanged", AgentStatus::as_str),
                        "heartbeat"
                    );
                }
                Some(outcome)
            }
            Err(e) => {
                persistence_failed("agent", &e, &heartbeat.agent_name);
                None
            }
        };
        RouteOutcome::Heartbeat {
            agent: heartbeat.agent_name,
            outcome,
        }
    }

    async fn pipeline(&self, event: PipelineEvent, span: &tracing::Span) -> RouteOutcome {
        debug!(
            msg_type = %event.msg_type,
            sender = %event.sender.name,
            recipient = %event.recipient.name,
            filename = event.filename.as_deref().unwrap_or_default(),
            "pipeline event"
        );

        if event.sender_explicit
            && let Err(e) = self
                .store
                .ensure_agent(&event.sender.name, event.sender.category)
                .await
        {
            persistence_failed("agent", &e, &event.payload.to_string());
        }

        let outcome = match self.tracker.apply(&event).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                persistence_failed("workflow", &e, &event.payload.to_string());
                None
            }
        };
        let workflow_id = outcome.as_ref().and_then(TrackOutcome::workflow_id);
        if let Some(id) = workflow_id {
            span.record("workflow.id", tracing::field::display(id));
        }

        let record = NewEventRecord {
            workflow_id,
            stage_id: outcome.as_ref().and_then(TrackOutcome::stage_id),
            msg_type: event.msg_type.as_str().to_string(),
            sender_name: event.sender.name.clone(),
            sender_category: event.sender.category,
            recipient_name: event.recipient.name.clone(),
            recipient_category: event.recipient.category,
            payload: event.payload.clone(),
            topic: event.topic.clone(),
            is_successful: outcome.as_ref().is_some_and(TrackOutcome::is_successful),
            received_at: event.received_at,
        };
        let record_id = match self.store.append_event(record).await {
            Ok(record) => Some(record.id),
            Err(e) => {
                persistence_failed("event", &e, &event.payload.to_string());
                None
            }
        };

        self.broadcaster.publish(&MonitorEvent {
            msg_type: event.msg_type.as_str().to_string(),
            agent: Some(event.sender.name),
            run_id: event.run_id,
            workflow_id: workflow_id.map(|id| id.to_string()).or(event.workflow_id),
            payload: event.payload,
            timestamp: event.received_at,
            source: EventSource::Broker,
        });

        RouteOutcome::Pipeline { record_id, outcome }
    }
}

fn discard(reason: DiscardReason) -> RouteOutcome {
    metrics::messages_discarded().add(1, &[KeyValue::new("reason", reason.as_str())]);
    RouteOutcome::Discarded(reason)
}

fn persistence_failed(record: &'static str, e: &crate::error::Error, payload: &str) {
    error!(record, error = %e, payload, "persistence failed, continuing");
    metrics::persistence_failures().add(1, &[KeyValue::new("record", record)]);
}

#[async_trait]
impl FrameHandler for MessageRouter {
    async fn on_message(&self, destination: &str, body: &str) {
        self.handle_body(destination, body).await;
    }

    async fn on_disconnected(&self) {
        warn!("broker session lost, inbound routing paused");
    }
}
