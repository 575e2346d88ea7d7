//! STF workflows and the per-agent stages they pass through.
//!
//! A workflow is one STF file moving down the fixed pipeline
//! simulator → data → processing → fast-monitor. Its status only moves
//! forward along that ladder, except for the side-exit into `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentCategory;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for workflow IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(WorkflowId)
    }
}

/// Newtype for stage IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub Uuid);

impl StageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Workflow status
// ---------------------------------------------------------------------------

/// Pipeline status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Generated,
    DataReceived,
    DataProcessing,
    DataComplete,
    ProcessingReceived,
    ProcessingProcessing,
    ProcessingComplete,
    FastmonReceived,
    FastmonComplete,
    WorkflowComplete,
    /// Side-exit, reachable from any non-terminal status.
    Failed,
}

impl WorkflowStatus {
    pub const LADDER: [WorkflowStatus; 10] = [
        WorkflowStatus::Generated,
        WorkflowStatus::DataReceived,
        WorkflowStatus::DataProcessing,
        WorkflowStatus::DataComplete,
        WorkflowStatus::ProcessingReceived,
        WorkflowStatus::ProcessingProcessing,
        WorkflowStatus::ProcessingComplete,
        WorkflowStatus::FastmonReceived,
        WorkflowStatus::FastmonComplete,
        WorkflowStatus::WorkflowComplete,
    ];

    /// Position on the forward ladder. `Failed` has none.
    pub fn rank(self) -> Option<usize> {
        Self::LADDER.iter().position(|s| *s == self)
    }

    /// Can a workflow in `self` be moved to `to`?
    ///
    /// Forward moves and re-applying the current status are allowed; the
    /// latter keeps repeated agent reports visible as fresh timestamps.
    /// Nothing leaves a terminal status, not even a repeat of it.
    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), to.rank()) {
            (Some(from), Some(to)) => to >= from,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::WorkflowComplete | WorkflowStatus::Failed
        )
    }

    /// Workflow status mirroring a stage status of the given agent category.
    pub fn for_stage(category: AgentCategory, stage: StageStatus) -> Option<WorkflowStatus> {
        use StageStatus as S;
        use WorkflowStatus as W;
        match (category, stage) {
            (AgentCategory::Data, S::Received) => Some(W::DataReceived),
            (AgentCategory::Data, S::Processing) => Some(W::DataProcessing),
            (AgentCategory::Data, S::Complete) => Some(W::DataComplete),
            (AgentCategory::Processing, S::Received) => Some(W::ProcessingReceived),
            (AgentCategory::Processing, S::Processing) => Some(W::ProcessingProcessing),
            (AgentCategory::Processing, S::Complete) => Some(W::ProcessingComplete),
            (AgentCategory::FastMonitor, S::Received) => Some(W::FastmonReceived),
            (AgentCategory::FastMonitor, S::Complete) => Some(W::FastmonComplete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Generated => "generated",
            WorkflowStatus::DataReceived => "data-received",
            WorkflowStatus::DataProcessing => "data-processing",
            WorkflowStatus::DataComplete => "data-complete",
            WorkflowStatus::ProcessingReceived => "processing-received",
            WorkflowStatus::ProcessingProcessing => "processing-processing",
            WorkflowStatus::ProcessingComplete => "processing-complete",
            WorkflowStatus::FastmonReceived => "fastmon-received",
            WorkflowStatus::FastmonComplete => "fastmon-complete",
            WorkflowStatus::WorkflowComplete => "workflow-complete",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::LADDER
            .iter()
            .copied()
            .chain(std::iter::once(WorkflowStatus::Failed))
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::error::Error::Other(format!("unknown workflow status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// One STF file's trip through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    /// Unique STF filename.
    pub filename: String,
    pub run_id: Option<String>,
    /// Machine state tag at generation time (e.g. "physics").
    pub daq_state: Option<String>,
    /// Machine substate tag at generation time (e.g. "run").
    pub daq_substate: Option<String>,
    /// Reported STF start, as sent by the simulator.
    pub stf_start: Option<DateTime<Utc>>,
    pub stf_end: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    /// Category of the agent currently owning the workflow.
    pub current_agent: AgentCategory,
    /// Raw generation payload.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields needed to register a freshly generated STF.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub filename: String,
    pub run_id: Option<String>,
    pub daq_state: Option<String>,
    pub daq_substate: Option<String>,
    pub stf_start: Option<DateTime<Utc>>,
    pub stf_end: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewWorkflow {
    pub(crate) fn into_workflow(self, id: WorkflowId) -> Workflow {
        Workflow {
            id,
            filename: self.filename,
            run_id: self.run_id,
            daq_state: self.daq_state,
            daq_substate: self.daq_substate,
            stf_start: self.stf_start,
            stf_end: self.stf_end,
            status: WorkflowStatus::Generated,
            current_agent: AgentCategory::Simulator,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.created_at,
            completed_at: None,
        }
    }
}

/// Result of registering a workflow.
#[derive(Debug)]
pub enum InsertWorkflow {
    Created(Box<Workflow>),
    /// A workflow with this filename already exists.
    Duplicate(WorkflowId),
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Status of one agent's visit to a workflow. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Received,
    Processing,
    Complete,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Received => "received",
            StageStatus::Processing => "processing",
            StageStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(StageStatus::Received),
            "processing" => Ok(StageStatus::Processing),
            "complete" => Ok(StageStatus::Complete),
            other => Err(crate::error::Error::Other(format!(
                "unknown stage status: {other}"
            ))),
        }
    }
}

/// One agent's participation in one workflow visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub workflow_id: WorkflowId,
    pub agent_category: AgentCategory,
    /// Owning agent instance. `None` until the agent reports on the stage itself.
    pub agent_name: Option<String>,
    pub status: StageStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    /// Time spent in the stage, once complete.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    pub fn is_open(&self) -> bool {
        self.status != StageStatus::Complete
    }

    pub fn is_claimed(&self) -> bool {
        self.agent_name.is_some()
    }
}

/// Fields needed to open a stage.
#[derive(Debug, Clone)]
pub struct NewStage {
    pub workflow_id: WorkflowId,
    pub agent_category: AgentCategory,
    pub agent_name: Option<String>,
    pub input: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NewStage {
    pub(crate) fn into_stage(self, id: StageId) -> Stage {
        Stage {
            id,
            workflow_id: self.workflow_id,
            agent_category: self.agent_category,
            agent_name: self.agent_name,
            status: StageStatus::Received,
            input: self.input,
            output: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            completed_at: None,
        }
    }
}
