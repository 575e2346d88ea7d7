//! Append-only log of every routed pipeline message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentCategory;
use super::workflow::{StageId, WorkflowId};

/// One inbound pipeline message, matched to a workflow or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub workflow_id: Option<WorkflowId>,
    pub stage_id: Option<StageId>,
    pub msg_type: String,
    pub sender_name: String,
    pub sender_category: AgentCategory,
    pub recipient_name: String,
    pub recipient_category: AgentCategory,
    /// Full message body as received.
    pub payload: serde_json::Value,
    /// Destination the message arrived on.
    pub topic: String,
    pub is_successful: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEventRecord {
    pub workflow_id: Option<WorkflowId>,
    pub stage_id: Option<StageId>,
    pub msg_type: String,
    pub sender_name: String,
    pub sender_category: AgentCategory,
    pub recipient_name: String,
    pub recipient_category: AgentCategory,
    pub payload: serde_json::Value,
    pub topic: String,
    pub is_successful: bool,
    pub received_at: DateTime<Utc>,
}

impl NewEventRecord {
    pub(crate) fn into_record(self, id: i64) -> EventRecord {
        EventRecord {
            id,
            workflow_id: self.workflow_id,
            stage_id: self.stage_id,
            msg_type: self.msg_type,
            sender_name: self.sender_name,
            sender_category: self.sender_category,
            recipient_name: self.recipient_name,
            recipient_category: self.recipient_category,
            payload: self.payload,
            topic: self.topic,
            is_successful: self.is_successful,
            received_at: self.received_at,
        }
    }
}
