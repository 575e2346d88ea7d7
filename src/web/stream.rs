//! Server-sent event stream for live dashboards.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio_stream::StreamExt;

use super::AppState;
use crate::broadcast::{StreamItem, SubscriptionFilter, subscription_stream};

/// Comma-separated allow-lists.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub msg_types: Option<String>,
    pub agents: Option<String>,
    pub run_ids: Option<String>,
    /// Alias of `run_ids`; both lists are merged.
    pub correlation_ids: Option<String>,
}

impl StreamQuery {
    pub fn filter(&self) -> SubscriptionFilter {
        let correlation = match (&self.run_ids, &self.correlation_ids) {
            (Some(a), Some(b)) => Some(format!("{a},{b}")),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        SubscriptionFilter::from_query(
            self.msg_types.as_deref(),
            self.agents.as_deref(),
            correlation.as_deref(),
        )
    }
}

pub async fn message_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let guard = state.broadcaster.attach(query.filter());
    let items = subscription_stream(
        guard,
        state.stream.heartbeat_interval,
        state.stream.poll_interval,
    );
    let events = items.map(|item| Ok::<_, Infallible>(to_sse(item)));

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events),
    )
        .into_response()
}

pub fn to_sse(item: StreamItem) -> Event {
    match item {
        StreamItem::Connected { client_id } => Event::default().event("connected").data(
            serde_json::json!({ "status": "connected", "client_id": client_id }).to_string(),
        ),
        StreamItem::Event(event) => Event::default()
            .event(event.msg_type.replace(['\r', '\n'], "_"))
            .data(event.payload.to_string()),
        StreamItem::Heartbeat { timestamp } => Event::default()
            .event("heartbeat")
            .data(serde_json::json!({ "timestamp": timestamp.to_rfc3339() }).to_string()),
    }
}

pub async fn stream_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let clients = state.broadcaster.snapshot();
    Json(serde_json::json!({
        "connected_clients": clients.len(),
        "client_ids": clients.iter().map(|c| c.client_id.clone()).collect::<Vec<_>>(),
        "clients": clients,
    }))
}
