//! HTTP surface: live event stream, stream status, announcements,
//! operator control and read-only listings.

mod api;
mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use crate::broadcast::{Broadcaster, InternalPublisher};
use crate::broker::MessageSink;
use crate::config::StreamConfig;
use crate::db::Db;
use crate::error::Error;
use crate::store::Store;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub broadcaster: Broadcaster,
    pub publisher: InternalPublisher,
    pub broker: Arc<dyn MessageSink>,
    pub stream: StreamConfig,
    /// Checked by `/health` when present.
    pub db: Option<Db>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/messages/stream", get(stream::message_stream))
        .route("/api/messages/stream/status", get(stream::stream_status))
        .route("/api/messages/publish", post(api::publish))
        .route("/api/control/{command}", post(api::control))
        .route("/api/agents", get(api::list_agents))
        .route("/api/workflows", get(api::list_workflows))
        .route("/api/workflows/{id}", get(api::get_workflow))
        .route("/api/events", get(api::list_events))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Error body returned by every handler.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %e, "request failed");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
