//! Inbound message catalogue.
//!
//! Every pipeline message carries a `msg_type` discriminator. Agents often
//! omit who sent a message and who it was meant for, so both are inferred
//! from the type through [`MsgType::route`]. That table is a heuristic over
//! the testbed's conventions, not a protocol guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::{AgentCategory, AgentStatus};
use super::workflow::StageStatus;

/// Known pipeline message types. Unrecognised types are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MsgType {
    RunImminent,
    StartRun,
    PauseRun,
    ResumeRun,
    EndRun,
    StfGen,
    DataReceived,
    DataProcessing,
    DataReady,
    ProcessingReceived,
    ProcessingStarted,
    ProcessingComplete,
    FastmonReceived,
    FastmonComplete,
    WorkflowFailed,
    RunWorkflow,
    StopWorkflow,
    Other(String),
}

/// A named participant with a pipeline role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownParty {
    pub name: &'static str,
    pub category: AgentCategory,
}

pub const SIMULATOR: KnownParty = KnownParty {
    name: "daq-simulator",
    category: AgentCategory::Simulator,
};
pub const DATA_AGENT: KnownParty = KnownParty {
    name: "data-agent",
    category: AgentCategory::Data,
};
pub const PROCESSING_AGENT: KnownParty = KnownParty {
    name: "processing-agent",
    category: AgentCategory::Processing,
};
pub const FASTMON_AGENT: KnownParty = KnownParty {
    name: "fastmon-agent",
    category: AgentCategory::FastMonitor,
};
pub const ALL_AGENTS: KnownParty = KnownParty {
    name: "all-agents",
    category: AgentCategory::Other,
};
pub const MONITOR: KnownParty = KnownParty {
    name: "swf-monitor",
    category: AgentCategory::Other,
};
pub const OPERATOR: KnownParty = KnownParty {
    name: "operator",
    category: AgentCategory::Other,
};
pub const UNKNOWN: KnownParty = KnownParty {
    name: "unknown",
    category: AgentCategory::Unknown,
};

/// Inferred sender and recipient of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub sender: KnownParty,
    pub recipient: KnownParty,
}

/// What a message does to workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Register a new STF workflow.
    Generate,
    /// The sending agent reports on its own stage.
    Stage {
        category: AgentCategory,
        status: StageStatus,
    },
    /// Ownership moves from one agent category to the next.
    HandOff {
        from: AgentCategory,
        to: AgentCategory,
    },
    Fail,
    /// Logged and broadcast only.
    Announce,
}

impl MsgType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "run_imminent" => MsgType::RunImminent,
            "start_run" => MsgType::StartRun,
            "pause_run" => MsgType::PauseRun,
            "resume_run" => MsgType::ResumeRun,
            "end_run" => MsgType::EndRun,
            "stf_gen" => MsgType::StfGen,
            "data_received" => MsgType::DataReceived,
            "data_processing" => MsgType::DataProcessing,
            "data_ready" => MsgType::DataReady,
            "processing_received" => MsgType::ProcessingReceived,
            "processing_started" => MsgType::ProcessingStarted,
            "processing_complete" => MsgType::ProcessingComplete,
            "fastmon_received" => MsgType::FastmonReceived,
            "fastmon_complete" => MsgType::FastmonComplete,
            "workflow_failed" => MsgType::WorkflowFailed,
            "run_workflow" => MsgType::RunWorkflow,
            "stop_workflow" => MsgType::StopWorkflow,
            other => MsgType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MsgType::RunImminent => "run_imminent",
            MsgType::StartRun => "start_run",
            MsgType::PauseRun => "pause_run",
            MsgType::ResumeRun => "resume_run",
            MsgType::EndRun => "end_run",
            MsgType::StfGen => "stf_gen",
            MsgType::DataReceived => "data_received",
            MsgType::DataProcessing => "data_processing",
            MsgType::DataReady => "data_ready",
            MsgType::ProcessingReceived => "processing_received",
            MsgType::ProcessingStarted => "processing_started",
            MsgType::ProcessingComplete => "processing_complete",
            MsgType::FastmonReceived => "fastmon_received",
            MsgType::FastmonComplete => "fastmon_complete",
            MsgType::WorkflowFailed => "workflow_failed",
            MsgType::RunWorkflow => "run_workflow",
            MsgType::StopWorkflow => "stop_workflow",
            MsgType::Other(raw) => raw,
        }
    }

    /// Sender/recipient inferred from the type alone.
    pub fn route(&self) -> Route {
        let (sender, recipient) = match self {
            MsgType::RunImminent
            | MsgType::StartRun
            | MsgType::PauseRun
            | MsgType::ResumeRun
            | MsgType::EndRun => (SIMULATOR, ALL_AGENTS),
            MsgType::StfGen => (SIMULATOR, DATA_AGENT),
            MsgType::DataReceived | MsgType::DataProcessing => (DATA_AGENT, MONITOR),
            MsgType::DataReady => (DATA_AGENT, PROCESSING_AGENT),
            MsgType::ProcessingReceived | MsgType::ProcessingStarted => {
                (PROCESSING_AGENT, MONITOR)
            }
            MsgType::ProcessingComplete => (PROCESSING_AGENT, FASTMON_AGENT),
            MsgType::FastmonReceived | MsgType::FastmonComplete => (FASTMON_AGENT, MONITOR),
            MsgType::WorkflowFailed => (UNKNOWN, MONITOR),
            MsgType::RunWorkflow | MsgType::StopWorkflow => (OPERATOR, SIMULATOR),
            MsgType::Other(_) => (UNKNOWN, UNKNOWN),
        };
        Route { sender, recipient }
    }

    pub fn effect(&self) -> Effect {
        use AgentCategory as C;
        match self {
            MsgType::StfGen => Effect::Generate,
            MsgType::DataReceived => Effect::Stage {
                category: C::Data,
                status: StageStatus::Received,
            },
            MsgType::DataProcessing => Effect::Stage {
                category: C::Data,
                status: StageStatus::Processing,
            },
            MsgType::DataReady => Effect::HandOff {
                from: C::Data,
                to: C::Processing,
            },
            MsgType::ProcessingReceived => Effect::Stage {
                category: C::Processing,
                status: StageStatus::Received,
            },
            MsgType::ProcessingStarted => Effect::Stage {
                category: C::Processing,
                status: StageStatus::Processing,
            },
            MsgType::ProcessingComplete => Effect::HandOff {
                from: C::Processing,
                to: C::FastMonitor,
            },
            MsgType::FastmonReceived => Effect::Stage {
                category: C::FastMonitor,
                status: StageStatus::Received,
            },
            MsgType::FastmonComplete => Effect::Stage {
                category: C::FastMonitor,
                status: StageStatus::Complete,
            },
            MsgType::WorkflowFailed => Effect::Fail,
            MsgType::RunImminent
            | MsgType::StartRun
            | MsgType::PauseRun
            | MsgType::ResumeRun
            | MsgType::EndRun
            | MsgType::RunWorkflow
            | MsgType::StopWorkflow
            | MsgType::Other(_) => Effect::Announce,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for MsgType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MsgType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MsgType::parse(&raw))
    }
}

// ---------------------------------------------------------------------------
// Classified payloads
// ---------------------------------------------------------------------------

/// A sender or recipient as recorded on an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub name: String,
    pub category: AgentCategory,
}

impl From<KnownParty> for Party {
    fn from(p: KnownParty) -> Self {
        Self {
            name: p.name.to_string(),
            category: p.category,
        }
    }
}

/// An agent liveness report: `{agent_name, status, timestamp?}`.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub agent_name: String,
    /// `None` when the report's status was null or blank.
    pub status: Option<AgentStatus>,
    pub reported_at: Option<DateTime<Utc>>,
}

/// A pipeline message, enriched with inferred routing.
#[derive(Debug, Clone)]
pub struct PipelineEvent {
    pub msg_type: MsgType,
    /// Explicit correlation id (`workflow_id`), if the sender knows it.
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
    pub filename: Option<String>,
    pub sender: Party,
    /// True when the sender named itself in the payload.
    pub sender_explicit: bool,
    pub recipient: Party,
    pub payload: serde_json::Value,
    pub topic: String,
    pub received_at: DateTime<Utc>,
}

impl PipelineEvent {
    /// String field from the payload. Numbers are accepted and rendered.
    pub fn field(&self, key: &str) -> Option<String> {
        field_str(&self.payload, key)
    }
}

/// Read a scalar JSON field as a non-empty string.
pub fn field_str(value: &serde_json::Value, key: &str) -> Option<String> {
    match value.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
