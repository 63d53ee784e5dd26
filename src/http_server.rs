//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::actions::Dispatcher;
use crate::state::SessionInfo;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Single action endpoint; always answers 200 with a JSON envelope
        .route("/actions", post(run_action))
        // Local registry view
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn run_action(State(state): State<AppState>, Json(req): Json<Value>) -> Json<Value> {
    Json(state.dispatcher.dispatch(req).await)
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.dispatcher.manager().sessions().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let handle = state
        .dispatcher
        .manager()
        .registry()
        .get(&id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(handle.info().await))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    Json(
        state
            .dispatcher
            .dispatch(serde_json::json!({ "action": "kill", "sessionId": id }))
            .await,
    )
}
