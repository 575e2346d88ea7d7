//! Core data model.
//!
//! Agents report liveness; workflows track one STF file each through the
//! pipeline; stages record each agent's visit; event records keep every
//! routed message.

pub mod agent;
pub mod event;
pub mod message;
pub mod workflow;

pub use agent::{Agent, AgentCategory, AgentStatus, HeartbeatOutcome};
pub use event::{EventRecord, NewEventRecord};
pub use message::{Effect, Heartbeat, MsgType, Party, PipelineEvent};
pub use workflow::{
    InsertWorkflow, NewStage, NewWorkflow, Stage, StageId, StageStatus, Workflow, WorkflowId,
    WorkflowStatus,
};
