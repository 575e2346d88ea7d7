//! Agent liveness and throughput counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::AgentStore;

const AGENT_COLUMNS: &str = "name, category, status, last_heartbeat, in_flight, processed_total, last_completed_at, created_at, updated_at";

#[async_trait]
impl AgentStore for super::Db {
    async fn record_heartbeat(
        &self,
        name: &str,
        status: Option<AgentStatus>,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome> {
        // xmax is 0 only on a freshly inserted row.
        let (inserted,): (bool,) = sqlx::query_as(
            "INSERT INTO agents (name, category, status, last_heartbeat, created_at, updated_at)
             VALUES ($1, 'unknown', COALESCE($2, 'unknown'), $3, $3, $3)
             ON CONFLICT (name) DO UPDATE
             SET status = COALESCE($2, agents.status), last_heartbeat = EXCLUDED.last_heartbeat, updated_at = EXCLUDED.updated_at
             RETURNING (xmax = 0)",
        )
        .bind(name)
        .bind(status.map(AgentStatus::as_str))
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            HeartbeatOutcome::Created
        } else {
            HeartbeatOutcome::Updated
        })
    }

    async fn ensure_agent(&self, name: &str, category: AgentCategory) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (name, category) VALUES ($1, $2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_stage_claimed(&self, name: &str, category: AgentCategory) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (name, category, in_flight) VALUES ($1, $2, 1)
             ON CONFLICT (name) DO UPDATE
             SET in_flight = agents.in_flight + 1, updated_at = now()",
        )
        .bind(name)
        .bind(category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_stage_completed(
        &self,
        name: &str,
        category: AgentCategory,
        claimed: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let release: i32 = if claimed { 1 } else { 0 };
        sqlx::query(
            "INSERT INTO agents (name, category, processed_total, last_completed_at, created_at, updated_at)
             VALUES ($1, $2, 1, $3, $3, $3)
             ON CONFLICT (name) DO UPDATE
             SET in_flight = GREATEST(agents.in_flight - $4, 0),
                 processed_total = agents.processed_total + 1,
                 last_completed_at = EXCLUDED.last_completed_at,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(name)
        .bind(category.as_str())
        .bind(at)
        .bind(release)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> Result<Agent> {
        let row: Option<AgentRow> =
            sqlx::query_as(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = $1"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("agent {name}")))?
            .try_into_agent()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(AgentRow::try_into_agent).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct AgentRow {
    name: String,
    category: String,
    status: String,
    last_heartbeat: Option<DateTime<Utc>>,
    in_flight: i32,
    processed_total: i64,
    last_completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AgentRow {
    fn try_into_agent(self) -> Result<Agent> {
        Ok(Agent {
            name: self.name,
            category: self.category.parse()?,
            status: self.status.parse()?,
            last_heartbeat: self.last_heartbeat,
            in_flight: self.in_flight.max(0) as u32,
            processed_total: self.processed_total.max(0) as u64,
            last_completed_at: self.last_completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
