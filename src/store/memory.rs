//! In-process store. Same semantics as the Postgres store, no durability.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AgentStore, EventFilter, EventStore, WorkflowFilter, WorkflowStore, validate_transition};
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Tables {
    agents: HashMap<String, Agent>,
    workflows: Vec<Workflow>,
    stages: Vec<Stage>,
    events: Vec<EventRecord>,
}

/// Store backed by plain collections behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of workflows registered so far.
    pub fn workflow_count(&self) -> usize {
        self.tables().workflows.len()
    }

    /// Number of event records appended so far.
    pub fn event_count(&self) -> usize {
        self.tables().events.len()
    }

    /// Number of agents known so far.
    pub fn agent_count(&self) -> usize {
        self.tables().agents.len()
    }
}

fn new_agent(name: &str, category: AgentCategory, at: DateTime<Utc>) -> Agent {
    Agent {
        name: name.to_string(),
        category,
        status: AgentStatus::Unknown,
        last_heartbeat: None,
        in_flight: 0,
        processed_total: 0,
        last_completed_at: None,
        created_at: at,
        updated_at: at,
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn record_heartbeat(
        &self,
        name: &str,
        status: Option<AgentStatus>,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome> {
        let mut tables = self.tables();
        let outcome = if tables.agents.contains_key(name) {
            HeartbeatOutcome::Updated
        } else {
            HeartbeatOutcome::Created
        };
        let agent = tables
            .agents
            .entry(name.to_string())
            .or_insert_with(|| new_agent(name, AgentCategory::Unknown, at));
        if let Some(status) = status {
            agent.status = status;
        }
        agent.last_heartbeat = Some(at);
        agent.updated_at = at;
        Ok(outcome)
    }

    async fn ensure_agent(&self, name: &str, category: AgentCategory) -> Result<()> {
        let now = Utc::now();
        self.tables()
            .agents
            .entry(name.to_string())
            .or_insert_with(|| new_agent(name, category, now));
        Ok(())
    }

    async fn record_stage_claimed(&self, name: &str, category: AgentCategory) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.tables();
        let agent = tables
            .agents
            .entry(name.to_string())
            .or_insert_with(|| new_agent(name, category, now));
        agent.in_flight += 1;
        agent.updated_at = now;
        Ok(())
    }

    async fn record_stage_completed(
        &self,
        name: &str,
        category: AgentCategory,
        claimed: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables();
        let agent = tables
            .agents
            .entry(name.to_string())
            .or_insert_with(|| new_agent(name, category, at));
        if claimed {
            agent.in_flight = agent.in_flight.saturating_sub(1);
        }
        agent.processed_total += 1;
        agent.last_completed_at = Some(at);
        agent.updated_at = at;
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> Result<Agent> {
        self.tables()
            .agents
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent {name}")))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.tables().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertWorkflow> {
        let mut tables = self.tables();
        if let Some(existing) = tables.workflows.iter().find(|w| w.filename == new.filename) {
            return Ok(InsertWorkflow::Duplicate(existing.id));
        }
        let workflow = new.into_workflow(WorkflowId::new());
        tables.workflows.push(workflow.clone());
        Ok(InsertWorkflow::Created(Box::new(workflow)))
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.tables()
            .workflows
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow {id}")))
    }

    async fn find_workflow_by_filename(&self, filename: &str) -> Result<Option<Workflow>> {
        Ok(self
            .tables()
            .workflows
            .iter()
            .find(|w| w.filename == filename)
            .cloned())
    }

    async fn transition_workflow(
        &self,
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        current_agent: AgentCategory,
        at: DateTime<Utc>,
    ) -> Result<Workflow> {
        validate_transition(from, to)?;

        let mut tables = self.tables();
        let workflow = tables
            .workflows
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| Error::NotFound(format!("workflow {id}")))?;
        if workflow.status != from {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        workflow.status = to;
        workflow.current_agent = current_agent;
        workflow.updated_at = at;
        if to.is_terminal() {
            workflow.completed_at = Some(at);
        }
        Ok(workflow.clone())
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let tables = self.tables();
        let mut workflows: Vec<Workflow> = tables
            .workflows
            .iter()
            .filter(|w| filter.status.is_none_or(|s| w.status == s))
            .filter(|w| {
                filter
                    .run_id
                    .as_deref()
                    .is_none_or(|run| w.run_id.as_deref() == Some(run))
            })
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        workflows.truncate(filter.limit.max(0) as usize);
        Ok(workflows)
    }

    async fn open_stage(
        &self,
        workflow_id: WorkflowId,
        category: AgentCategory,
    ) -> Result<Option<Stage>> {
        Ok(self
            .tables()
            .stages
            .iter()
            .rev()
            .find(|s| s.workflow_id == workflow_id && s.agent_category == category && s.is_open())
            .cloned())
    }

    async fn insert_stage(&self, new: NewStage) -> Result<Stage> {
        let stage = new.into_stage(StageId::new());
        self.tables().stages.push(stage.clone());
        Ok(stage)
    }

    async fn save_stage(&self, stage: &Stage) -> Result<()> {
        let mut tables = self.tables();
        let slot = tables
            .stages
            .iter_mut()
            .find(|s| s.id == stage.id)
            .ok_or_else(|| Error::NotFound(format!("stage {}", stage.id)))?;
        *slot = stage.clone();
        Ok(())
    }

    async fn list_stages(&self, workflow_id: WorkflowId) -> Result<Vec<Stage>> {
        Ok(self
            .tables()
            .stages
            .iter()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, new: NewEventRecord) -> Result<EventRecord> {
        let mut tables = self.tables();
        let record = new.into_record(tables.events.len() as i64 + 1);
        tables.events.push(record.clone());
        Ok(record)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let tables = self.tables();
        Ok(tables
            .events
            .iter()
            .rev()
            .filter(|e| filter.workflow_id.is_none_or(|id| e.workflow_id == Some(id)))
            .filter(|e| {
                filter
                    .msg_type
                    .as_deref()
                    .is_none_or(|ty| e.msg_type == ty)
            })
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
