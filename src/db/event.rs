//! Routed-event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;
use crate::store::{EventFilter, EventStore};

#[async_trait]
impl EventStore for super::Db {
    async fn append_event(&self, new: NewEventRecord) -> Result<EventRecord> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO event_records (workflow_id, stage_id, msg_type, sender_name, sender_category, recipient_name, recipient_category, payload, topic, is_successful, received_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING id",
        )
        .bind(new.workflow_id.map(|w| w.0))
        .bind(new.stage_id.map(|s| s.0))
        .bind(&new.msg_type)
        .bind(&new.sender_name)
        .bind(new.sender_category.as_str())
        .bind(&new.recipient_name)
        .bind(new.recipient_category.as_str())
        .bind(&new.payload)
        .bind(&new.topic)
        .bind(new.is_successful)
        .bind(new.received_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(new.into_record(id))
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, workflow_id, stage_id, msg_type, sender_name, sender_category, recipient_name, recipient_category, payload, topic, is_successful, received_at
             FROM event_records
             WHERE ($1::uuid IS NULL OR workflow_id = $1)
               AND ($2::text IS NULL OR msg_type = $2)
             ORDER BY id DESC
             LIMIT $3",
        )
        .bind(filter.workflow_id.map(|w| w.0))
        .bind(filter.msg_type.as_deref())
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::try_into_record).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    workflow_id: Option<Uuid>,
    stage_id: Option<Uuid>,
    msg_type: String,
    sender_name: String,
    sender_category: String,
    recipient_name: String,
    recipient_category: String,
    payload: serde_json::Value,
    topic: String,
    is_successful: bool,
    received_at: DateTime<Utc>,
}

impl EventRow {
    fn try_into_record(self) -> Result<EventRecord> {
        Ok(EventRecord {
            id: self.id,
            workflow_id: self.workflow_id.map(WorkflowId),
            stage_id: self.stage_id.map(StageId),
            msg_type: self.msg_type,
            sender_name: self.sender_name,
            sender_category: self.sender_category.parse()?,
            recipient_name: self.recipient_name,
            recipient_category: self.recipient_category.parse()?,
            payload: self.payload,
            topic: self.topic,
            is_successful: self.is_successful,
            received_at: self.received_at,
        })
    }
}
