//! Workflow state tracker.
//!
//! Sole writer of workflow and stage state. Each pipeline event is matched
//! to its workflow, then applied according to its [`Effect`]: generation
//! registers a workflow, an agent's own report moves its stage, a hand-off
//! closes the sender's stage and opens the next category's.
//!
//! A duplicate generation is rejected, as is anything aimed at a finished
//! or failed workflow. Every other event is applied each time it arrives,
//! so a repeated hand-off opens and closes a second stage visit for the
//! sending category.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::Store;
use crate::telemetry::{self, metrics};

/// What applying one event did.
#[derive(Debug, Clone)]
pub enum TrackOutcome {
    /// A new workflow was registered.
    Created { workflow: Box<Workflow> },
    /// A generation event named a filename that is already tracked.
    Duplicate { workflow_id: WorkflowId },
    /// Workflow status (and usually a stage) moved.
    Advanced {
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        stage_id: Option<StageId>,
    },
    /// The event belongs to a workflow but carries no state change.
    Linked { workflow_id: WorkflowId },
    /// The event would move the workflow backwards or out of a terminal status.
    Rejected {
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// No workflow matched.
    Unrelated,
}

impl TrackOutcome {
    pub fn workflow_id(&self) -> Option<WorkflowId> {
        match self {
            TrackOutcome::Created { workflow } => Some(workflow.id),
            TrackOutcome::Duplicate { workflow_id }
            | TrackOutcome::Advanced { workflow_id, .. }
            | TrackOutcome::Linked { workflow_id }
            | TrackOutcome::Rejected { workflow_id, .. } => Some(*workflow_id),
            TrackOutcome::Unrelated => None,
        }
    }

    pub fn stage_id(&self) -> Option<StageId> {
        match self {
            TrackOutcome::Advanced { stage_id, .. } => *stage_id,
            _ => None,
        }
    }

    /// Whether the event was applied as intended.
    pub fn is_successful(&self) -> bool {
        !matches!(
            self,
            TrackOutcome::Duplicate { .. } | TrackOutcome::Rejected { .. }
        )
    }
}

/// Applies pipeline events to workflow and stage records.
pub struct WorkflowTracker {
    store: Arc<dyn Store>,
}

impl WorkflowTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, event: &PipelineEvent) -> Result<TrackOutcome> {
        match event.msg_type.effect() {
            Effect::Generate => self.generate(event).await,
            effect => {
                let Some(workflow) = self.correlate(event).await? else {
                    debug!(msg_type = %event.msg_type, "no matching workflow");
                    return Ok(TrackOutcome::Unrelated);
                };
                match effect {
                    Effect::Announce | Effect::Generate => Ok(TrackOutcome::Linked {
                        workflow_id: workflow.id,
                    }),
                    Effect::Fail => self.fail(workflow, event).await,
                    Effect::Stage { category, status } => {
                        self.own_report(workflow, category, status, event).await
                    }
                    Effect::HandOff { from, to } => self.hand_off(workflow, from, to, event).await,
                }
            }
        }
    }

    /// Match by explicit `workflow_id`, then by filename.
    async fn correlate(&self, event: &PipelineEvent) -> Result<Option<Workflow>> {
        if let Some(raw) = event.workflow_id.as_deref() {
            match raw.parse::<WorkflowId>() {
                Ok(id) => match self.store.get_workflow(id).await {
                    Ok(workflow) => return Ok(Some(workflow)),
                    Err(Error::NotFound(_)) => {
                        debug!(workflow_id = raw, "correlation id not found, trying filename")
                    }
                    Err(e) => return Err(e),
                },
                Err(_) => debug!(workflow_id = raw, "correlation id is not a workflow id"),
            }
        }
        match event.filename.as_deref() {
            Some(filename) => self.store.find_workflow_by_filename(filename).await,
            None => Ok(None),
        }
    }

    async fn generate(&self, event: &PipelineEvent) -> Result<TrackOutcome> {
        let Some(filename) = event.filename.clone() else {
            warn!(msg_type = %event.msg_type, "generation event without filename");
            return Ok(TrackOutcome::Unrelated);
        };

        let new = NewWorkflow {
            filename,
            run_id: event.run_id.clone(),
            daq_state: event.field("state"),
            daq_substate: event.field("substate"),
            stf_start: event.field("start").as_deref().and_then(parse_stf_time),
            stf_end: event.field("end").as_deref().and_then(parse_stf_time),
            metadata: event.payload.clone(),
            created_at: event.received_at,
        };

        match self.store.insert_workflow(new).await? {
            InsertWorkflow::Created(workflow) => {
                info!(
                    workflow_id = %workflow.id,
                    filename = %workflow.filename,
                    run_id = workflow.run_id.as_deref().unwrap_or_default(),
                    "workflow created"
                );
                Ok(TrackOutcome::Created { workflow })
            }
            InsertWorkflow::Duplicate(workflow_id) => {
                warn!(
                    workflow_id = %workflow_id,
                    filename = event.filename.as_deref().unwrap_or_default(),
                    "duplicate generation ignored"
                );
                Ok(TrackOutcome::Duplicate { workflow_id })
            }
        }
    }

    async fn fail(&self, workflow: Workflow, event: &PipelineEvent) -> Result<TrackOutcome> {
        let from = workflow.status;
        let to = WorkflowStatus::Failed;
        if !from.can_transition_to(to) {
            return Ok(self.reject(&workflow, to, event));
        }
        match self
            .advance(&workflow, to, workflow.current_agent, event.received_at)
            .await?
        {
            Some(_) => Ok(TrackOutcome::Advanced {
                workflow_id: workflow.id,
                from,
                to,
                stage_id: None,
            }),
            None => Ok(rejected(&workflow, to)),
        }
    }

    /// An agent reports on its own stage.
    async fn own_report(
        &self,
        workflow: Workflow,
        category: AgentCategory,
        status: StageStatus,
        event: &PipelineEvent,
    ) -> Result<TrackOutcome> {
        let target = if category == AgentCategory::FastMonitor && status == StageStatus::Complete {
            Some(WorkflowStatus::WorkflowComplete)
        } else {
            WorkflowStatus::for_stage(category, status)
        };
        if workflow.status.is_terminal() {
            let to = target.unwrap_or(workflow.status);
            return Ok(self.reject(&workflow, to, event));
        }
        if let Some(to) = target
            && !workflow.status.can_transition_to(to)
        {
            return Ok(self.reject(&workflow, to, event));
        }

        let at = event.received_at;
        let sender = &event.sender.name;
        let mut stage = match self.store.open_stage(workflow.id, category).await? {
            Some(stage) => stage,
            None => {
                self.store
                    .insert_stage(NewStage {
                        workflow_id: workflow.id,
                        agent_category: category,
                        agent_name: None,
                        input: Some(event.payload.clone()),
                        created_at: at,
                    })
                    .await?
            }
        };

        if !stage.is_claimed() {
            stage.agent_name = Some(sender.clone());
            self.store.record_stage_claimed(sender, category).await?;
        }
        if status > stage.status {
            stage.status = status;
        }
        if status == StageStatus::Complete {
            stage.completed_at = Some(at);
            stage.output = Some(event.payload.clone());
        }
        stage.updated_at = at;
        self.store.save_stage(&stage).await?;

        if status == StageStatus::Complete {
            let owner = stage.agent_name.as_deref().unwrap_or(sender);
            self.store
                .record_stage_completed(owner, category, true, at)
                .await?;
        }

        let Some(to) = target else {
            return Ok(TrackOutcome::Linked {
                workflow_id: workflow.id,
            });
        };
        match self.advance(&workflow, to, category, at).await? {
            Some(_) => Ok(TrackOutcome::Advanced {
                workflow_id: workflow.id,
                from: workflow.status,
                to,
                stage_id: Some(stage.id),
            }),
            None => Ok(rejected(&workflow, to)),
        }
    }

    /// Ownership moves from `from` to `to`.
    async fn hand_off(
        &self,
        workflow: Workflow,
        from: AgentCategory,
        to: AgentCategory,
        event: &PipelineEvent,
    ) -> Result<TrackOutcome> {
        let Some(target) = WorkflowStatus::for_stage(from, StageStatus::Complete) else {
            return Ok(TrackOutcome::Linked {
                workflow_id: workflow.id,
            });
        };
        if !workflow.status.can_transition_to(target) {
            return Ok(self.reject(&workflow, target, event));
        }

        let at = event.received_at;
        let sender = &event.sender.name;

        // Close the sender's stage. A hand-off without a prior report
        // opens and closes the visit in one go.
        let (mut done, claimed) = match self.store.open_stage(workflow.id, from).await? {
            Some(stage) => {
                let claimed = stage.is_claimed();
                (stage, claimed)
            }
            None => {
                let stage = self
                    .store
                    .insert_stage(NewStage {
                        workflow_id: workflow.id,
                        agent_category: from,
                        agent_name: None,
                        input: None,
                        created_at: at,
                    })
                    .await?;
                (stage, false)
            }
        };
        if done.agent_name.is_none() {
            done.agent_name = Some(sender.clone());
        }
        done.status = StageStatus::Complete;
        done.output = Some(event.payload.clone());
        done.completed_at = Some(at);
        done.updated_at = at;
        self.store.save_stage(&done).await?;

        let owner = done.agent_name.as_deref().unwrap_or(sender);
        self.store
            .record_stage_completed(owner, from, claimed, at)
            .await?;

        // Open (or touch) the receiving stage. It stays unclaimed until
        // the receiving agent reports on it.
        match self.store.open_stage(workflow.id, to).await? {
            Some(mut next) => {
                next.updated_at = at;
                self.store.save_stage(&next).await?;
            }
            None => {
                self.store
                    .insert_stage(NewStage {
                        workflow_id: workflow.id,
                        agent_category: to,
                        agent_name: None,
                        input: Some(event.payload.clone()),
                        created_at: at,
                    })
                    .await?;
            }
        }

        match self.advance(&workflow, target, to, at).await? {
            Some(_) => Ok(TrackOutcome::Advanced {
                workflow_id: workflow.id,
                from: workflow.status,
                to: target,
                stage_id: Some(done.id),
            }),
            None => Ok(rejected(&workflow, target)),
        }
    }

    /// Move the workflow to `to`. `None` when the move lost a race or is not allowed.
    async fn advance(
        &self,
        workflow: &Workflow,
        to: WorkflowStatus,
        current_agent: AgentCategory,
        at: DateTime<Utc>,
    ) -> Result<Option<Workflow>> {
        let from = workflow.status;
        match self
            .store
            .transition_workflow(workflow.id, from, to, current_agent, at)
            .await
        {
            Ok(updated) => {
                telemetry::message::record_state_transition(
                    &tracing::Span::current(),
                    from.as_str(),
                    to.as_str(),
                );
                metrics::workflow_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", from.as_str()),
                        KeyValue::new("to", to.as_str()),
                    ],
                );
                Ok(Some(updated))
            }
            Err(Error::InvalidTransition { .. }) => {
                warn!(
                    workflow_id = %workflow.id,
                    from = %from,
                    to = %to,
                    "workflow changed underneath transition"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn reject(&self, workflow: &Workflow, to: WorkflowStatus, event: &PipelineEvent) -> TrackOutcome {
        warn!(
            workflow_id = %workflow.id,
            filename = %workflow.filename,
            msg_type = %event.msg_type,
            from = %workflow.status,
            to = %to,
            "transition not allowed, event ignored"
        );
        rejected(workflow, to)
    }
}

fn rejected(workflow: &Workflow, to: WorkflowStatus) -> TrackOutcome {
    TrackOutcome::Rejected {
        workflow_id: workflow.id,
        from: workflow.status,
        to,
    }
}

/// STF times arrive as `YYYYmmddHHMMSS` (UTC); RFC 3339 is accepted too.
pub fn parse_stf_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}
