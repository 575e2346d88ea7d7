//! Agent records: liveness and per-agent throughput counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role an agent plays in the STF pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentCategory {
    Simulator,
    Data,
    Processing,
    FastMonitor,
    Other,
    Unknown,
}

impl AgentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCategory::Simulator => "simulator",
            AgentCategory::Data => "data",
            AgentCategory::Processing => "processing",
            AgentCategory::FastMonitor => "fast-monitor",
            AgentCategory::Other => "other",
            AgentCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AgentCategory {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulator" | "daqsim" => Ok(AgentCategory::Simulator),
            "data" => Ok(AgentCategory::Data),
            "processing" => Ok(AgentCategory::Processing),
            "fast-monitor" | "fastmon" => Ok(AgentCategory::FastMonitor),
            "other" => Ok(AgentCategory::Other),
            "unknown" => Ok(AgentCategory::Unknown),
            other => Err(crate::error::Error::Other(format!(
                "unknown agent category: {other}"
            ))),
        }
    }
}

/// Liveness as last reported by the agent itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Unknown,
    Ok,
    Warning,
    Error,
}

impl AgentStatus {
    /// Lenient parse for heartbeat payloads. Anything unrecognised is `Unknown`.
    pub fn from_report(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => AgentStatus::Ok,
            "WARNING" | "WARN" => AgentStatus::Warning,
            "ERROR" => AgentStatus::Error,
            _ => AgentStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Unknown => "unknown",
            AgentStatus::Ok => "ok",
            AgentStatus::Warning => "warning",
            AgentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(AgentStatus::Unknown),
            "ok" => Ok(AgentStatus::Ok),
            "warning" => Ok(AgentStatus::Warning),
            "error" => Ok(AgentStatus::Error),
            other => Err(crate::error::Error::Other(format!(
                "unknown agent status: {other}"
            ))),
        }
    }
}

/// A running (or once-seen) agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique instance name, e.g. "data-agent-emulated".
    pub name: String,
    pub category: AgentCategory,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Stages this agent has claimed and not yet completed.
    pub in_flight: u32,
    /// Stages this agent has completed over its lifetime.
    pub processed_total: u64,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of applying a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Created,
    Updated,
}
