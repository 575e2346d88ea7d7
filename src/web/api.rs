//! Request/response handlers: announcements, operator control, listings, health.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::broker::Destination;
use crate::event::MonitorEvent;
use crate::model::message::MONITOR;
use crate::model::{Agent, EventRecord, MsgType, Workflow, WorkflowId, WorkflowStatus};
use crate::store::{EventFilter, WorkflowFilter};

const MAX_LIMIT: i64 = 1000;

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(100).clamp(1, MAX_LIMIT)
}

// ---------------------------------------------------------------------------
// Announcements and control
// ---------------------------------------------------------------------------

/// Push an operator announcement onto the internal channel.
pub async fn publish(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let event = MonitorEvent::announcement(body)
        .ok_or_else(|| ApiError::bad_request("body must be a JSON object with msg_type"))?;
    let msg_type = event.msg_type.clone();
    if !state.publisher.announce(event) {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "announcement channel unavailable",
        ));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "msg_type": msg_type })),
    ))
}

/// Send `run_workflow` / `stop_workflow` to the control queue.
///
/// An optional JSON object body is forwarded as the command's parameters.
pub async fn control(
    State(state): State<AppState>,
    Path(command): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let msg_type = match command.as_str() {
        "start" => MsgType::RunWorkflow,
        "stop" => MsgType::StopWorkflow,
        other => {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("unknown control command: {other}"),
            ));
        }
    };

    let mut message = if body.is_empty() {
        serde_json::Map::new()
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(ApiError::bad_request("body must be a JSON object")),
            Err(e) => return Err(ApiError::bad_request(format!("invalid JSON body: {e}"))),
        }
    };
    if msg_type == MsgType::StopWorkflow && !message.contains_key("execution_id") {
        return Err(ApiError::bad_request("stop requires execution_id"));
    }
    message.insert("msg_type".into(), json!(msg_type.as_str()));
    message.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    message.insert("source".into(), json!(MONITOR.name));
    let message = Value::Object(message);

    let destination = Destination::Control.to_string();
    if !state.broker.send(&destination, &message).await {
        warn!(msg_type = %msg_type, "control command not sent, broker unavailable");
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "broker unavailable",
        ));
    }
    info!(msg_type = %msg_type, %destination, "control command sent");

    if let Some(event) = MonitorEvent::announcement(message.clone()) {
        state.publisher.announce(event);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "sent": true, "destination": destination, "message": message })),
    ))
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

pub async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.store.list_agents().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkflowQuery {
    pub status: Option<String>,
    pub run_id: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<WorkflowQuery>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<WorkflowStatus>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let filter = WorkflowFilter {
        status,
        run_id: query.run_id,
        limit: clamp_limit(query.limit),
    };
    Ok(Json(state.store.list_workflows(&filter).await?))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id: WorkflowId = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid workflow id: {id}")))?;
    let workflow = state.store.get_workflow(id).await?;
    let stages = state.store.list_stages(id).await?;
    Ok(Json(json!({ "workflow": workflow, "stages": stages })))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub workflow_id: Option<String>,
    pub msg_type: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let workflow_id = query
        .workflow_id
        .as_deref()
        .map(str::parse::<WorkflowId>)
        .transpose()
        .map_err(|e| ApiError::bad_request(format!("invalid workflow id: {e}")))?;
    let filter = EventFilter {
        workflow_id,
        msg_type: query.msg_type,
        limit: clamp_limit(query.limit),
    };
    Ok(Json(state.store.list_events(&filter).await?))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => "ok",
            Err(e) => {
                warn!(error = %e, "database health check failed");
                "error"
            }
        },
        None => "absent",
    };
    let broker = state.broker.is_connected();
    let healthy = database != "error";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy && broker { "ok" } else { "degraded" },
            "database": database,
            "broker_connected": broker,
            "stream_clients": state.broadcaster.client_count(),
        })),
    )
}
