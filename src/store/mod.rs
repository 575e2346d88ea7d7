//! Storage seams for the monitor's four record types.
//!
//! The router and tracker only talk to these traits. [`crate::db::Db`]
//! implements them on Postgres; [`MemoryStore`] keeps everything in
//! process for tests and dry runs.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::*;

/// Filters for workflow listings.
#[derive(Debug, Clone)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub run_id: Option<String>,
    pub limit: i64,
}

impl Default for WorkflowFilter {
    fn default() -> Self {
        Self {
            status: None,
            run_id: None,
            limit: 100,
        }
    }
}

/// Filters for event-record listings.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub workflow_id: Option<WorkflowId>,
    pub msg_type: Option<String>,
    pub limit: i64,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            workflow_id: None,
            msg_type: None,
            limit: 100,
        }
    }
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Upsert by name. A new agent gets category `unknown`; an existing
    /// agent only has its status and heartbeat time refreshed. A `None`
    /// status keeps the stored one.
    async fn record_heartbeat(
        &self,
        name: &str,
        status: Option<AgentStatus>,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome>;

    /// Create the agent if absent. Never touches an existing record.
    async fn ensure_agent(&self, name: &str, category: AgentCategory) -> Result<()>;

    /// The agent took ownership of a stage.
    async fn record_stage_claimed(&self, name: &str, category: AgentCategory) -> Result<()>;

    /// The agent finished a stage. `claimed` releases one in-flight slot.
    async fn record_stage_completed(
        &self,
        name: &str,
        category: AgentCategory,
        claimed: bool,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_agent(&self, name: &str) -> Result<Agent>;

    async fn list_agents(&self) -> Result<Vec<Agent>>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Register a workflow. Filenames are unique; a second insert reports
    /// the existing id instead of creating a record.
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertWorkflow>;

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow>;

    async fn find_workflow_by_filename(&self, filename: &str) -> Result<Option<Workflow>>;

    /// Move a workflow `from` → `to` with optimistic concurrency.
    async fn transition_workflow(
        &self,
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        current_agent: AgentCategory,
        at: DateTime<Utc>,
    ) -> Result<Workflow>;

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>>;

    /// Latest not-yet-complete stage of a category on a workflow.
    async fn open_stage(
        &self,
        workflow_id: WorkflowId,
        category: AgentCategory,
    ) -> Result<Option<Stage>>;

    async fn insert_stage(&self, new: NewStage) -> Result<Stage>;

    /// Persist a mutated stage in place.
    async fn save_stage(&self, stage: &Stage) -> Result<()>;

    /// Stages of a workflow, oldest first.
    async fn list_stages(&self, workflow_id: WorkflowId) -> Result<Vec<Stage>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, new: NewEventRecord) -> Result<EventRecord>;

    /// Newest first.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>>;
}

/// Everything the pipeline needs from persistence.
pub trait Store: AgentStore + WorkflowStore + EventStore {}

impl<T: AgentStore + WorkflowStore + EventStore> Store for T {}

/// Validate a workflow transition, returning an error if disallowed.
pub(crate) fn validate_transition(from: WorkflowStatus, to: WorkflowStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
