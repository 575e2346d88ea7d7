//! Workflow registration, status transitions and stages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{WorkflowFilter, WorkflowStore, validate_transition};

const WORKFLOW_COLUMNS: &str = "id, filename, run_id, daq_state, daq_substate, stf_start, stf_end, status, current_agent, metadata, created_at, updated_at, completed_at";
const STAGE_COLUMNS: &str = "id, workflow_id, agent_category, agent_name, status, input, output, created_at, updated_at, completed_at";

#[async_trait]
impl WorkflowStore for super::Db {
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertWorkflow> {
        let workflow = new.into_workflow(WorkflowId::new());

        // The unique filename index settles concurrent generate messages.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO workflows (id, filename, run_id, daq_state, daq_substate, stf_start, stf_end, status, current_agent, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
             ON CONFLICT (filename) DO NOTHING
             RETURNING id",
        )
        .bind(workflow.id.0)
        .bind(&workflow.filename)
        .bind(&workflow.run_id)
        .bind(&workflow.daq_state)
        .bind(&workflow.daq_substate)
        .bind(workflow.stf_start)
        .bind(workflow.stf_end)
        .bind(workflow.status.as_str())
        .bind(workflow.current_agent.as_str())
        .bind(&workflow.metadata)
        .bind(workflow.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(InsertWorkflow::Created(Box::new(workflow)));
        }

        let (existing,): (Uuid,) = sqlx::query_as("SELECT id FROM workflows WHERE filename = $1")
            .bind(&workflow.filename)
            .fetch_one(&self.pool)
            .await?;
        Ok(InsertWorkflow::Duplicate(WorkflowId(existing)))
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        let row: Option<WorkflowRow> =
            sqlx::query_as(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("workflow {id}")))?
            .try_into_workflow()
    }

    async fn find_workflow_by_filename(&self, filename: &str) -> Result<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE filename = $1"
        ))
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRow::try_into_workflow).transpose()
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

        let completed_at = if to.is_terminal() { Some(at) } else { None };
        let rows_affected = sqlx::query(
            "UPDATE workflows SET status = $1, current_agent = $2, updated_at = $3, completed_at = COALESCE($4, completed_at)
             WHERE id = $5 AND status = $6",
        )
        .bind(to.as_str())
        .bind(current_agent.as_str())
        .bind(at)
        .bind(completed_at)
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.get_workflow(id).await
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR run_id = $2)
             ORDER BY created_at DESC
             LIMIT $3"
        ))
        .bind(filter.status.map(WorkflowStatus::as_str))
        .bind(filter.run_id.as_deref())
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(WorkflowRow::try_into_workflow)
            .collect()
    }

    async fn open_stage(
        &self,
        workflow_id: WorkflowId,
        category: AgentCategory,
    ) -> Result<Option<Stage>> {
        let row: Option<StageRow> = sqlx::query_as(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages
             WHERE workflow_id = $1 AND agent_category = $2 AND status <> 'complete'
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(workflow_id.0)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StageRow::try_into_stage).transpose()
    }

    async fn insert_stage(&self, new: NewStage) -> Result<Stage> {
        let stage = new.into_stage(StageId::new());
        sqlx::query(
            "INSERT INTO stages (id, workflow_id, agent_category, agent_name, status, input, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(stage.id.0)
        .bind(stage.workflow_id.0)
        .bind(stage.agent_category.as_str())
        .bind(&stage.agent_name)
        .bind(stage.status.as_str())
        .bind(&stage.input)
        .bind(stage.created_at)
        .execute(&self.pool)
        .await?;
        Ok(stage)
    }

    async fn save_stage(&self, stage: &Stage) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE stages SET agent_name = $1, status = $2, input = $3, output = $4, updated_at = $5, completed_at = $6
             WHERE id = $7",
        )
        .bind(&stage.agent_name)
        .bind(stage.status.as_str())
        .bind(&stage.input)
        .bind(&stage.output)
        .bind(stage.updated_at)
        .bind(stage.completed_at)
        .bind(stage.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("stage {}", stage.id)));
        }
        Ok(())
    }

    async fn list_stages(&self, workflow_id: WorkflowId) -> Result<Vec<Stage>> {
        let rows: Vec<StageRow> = sqlx::query_as(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE workflow_id = $1 ORDER BY created_at, id"
        ))
        .bind(workflow_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StageRow::try_into_stage).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    filename: String,
    run_id: Option<String>,
    daq_state: Option<String>,
    daq_substate: Option<String>,
    stf_start: Option<DateTime<Utc>>,
    stf_end: Option<DateTime<Utc>>,
    status: String,
    current_agent: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRow {
    fn try_into_workflow(self) -> Result<Workflow> {
        Ok(Workflow {
            id: WorkflowId(self.id),
            filename: self.filename,
            run_id: self.run_id,
            daq_state: self.daq_state,
            daq_substate: self.daq_substate,
            stf_start: self.stf_start,
            stf_end: self.stf_end,
            status: self.status.parse()?,
            current_agent: self.current_agent.parse()?,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct StageRow {
    id: Uuid,
    workflow_id: Uuid,
    agent_category: String,
    agent_name: Option<String>,
    status: String,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl StageRow {
    fn try_into_stage(self) -> Result<Stage> {
        Ok(Stage {
            id: StageId(self.id),
            workflow_id: WorkflowId(self.workflow_id),
            agent_category: self.agent_category.parse()?,
            agent_name: self.agent_name,
            status: self.status.parse()?,
            input: self.input,
            output: self.output,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
