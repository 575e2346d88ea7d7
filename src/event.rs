//! Events fanned out to live dashboard subscribers.
//!
//! Both the broker path (router) and request handlers publish the same
//! envelope; subscribers filter on `msg_type`, `agent` and the correlation
//! ids (`run_id`, `workflow_id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::message::field_str;

/// Where an event entered the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Broker,
    Internal,
}

/// One broadcastable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub msg_type: String,
    /// Name of the agent the event is about (the sender, for broker messages).
    pub agent: Option<String>,
    pub run_id: Option<String>,
    pub workflow_id: Option<String>,
    /// Body streamed to clients.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
}

impl MonitorEvent {
    /// Build an internally announced event from a JSON body.
    ///
    /// `msg_type` is required. The agent is taken from `processed_by`,
    /// falling back to `agent_name` and then `sender`.
    pub fn announcement(payload: serde_json::Value) -> Option<Self> {
        let msg_type = field_str(&payload, "msg_type")?;
        let agent = field_str(&payload, "processed_by")
            .or_else(|| field_str(&payload, "agent_name"))
            .or_else(|| field_str(&payload, "sender"));
        Some(Self {
            msg_type,
            agent,
            run_id: field_str(&payload, "run_id"),
            workflow_id: field_str(&payload, "workflow_id"),
            payload,
            timestamp: Utc::now(),
            source: EventSource::Internal,
        })
    }
}
