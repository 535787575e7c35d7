//! HTTP streaming transport (feature = `server`).
//!
//! A thin axum surface over the orchestrator and the history store:
//!
//! - `POST /chat` — run one session; the response body is one JSON event per
//!   line, in session order, terminated by a `done` event;
//! - `GET /health` — liveness probe;
//! - `GET /conversations`, `POST /conversations`, `GET /conversations/{id}`,
//!   `DELETE /conversations/{id}` — conversation management;
//! - `GET /events?limit=N` — the last N archived bus events.
//!
//! The transport holds no session state of its own: each chat request builds
//! a fresh [`Orchestrator`] over the shared backends, restores the
//! conversation's leader history, and persists the exchange through the
//! single-writer [`HistoryWriter`].

use crate::crewllm::agent::AgentDeps;
use crate::crewllm::config::Settings;
use crate::crewllm::event_logger::EventLogger;
use crate::crewllm::history::{HistoryWriter, SqliteHistoryStore, StoredMessage};
use crate::crewllm::orchestrator::{Orchestrator, SessionOptions, StreamEvent};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub deps: AgentDeps,
    pub settings: Settings,
    pub history: Arc<SqliteHistoryStore>,
    pub writer: Arc<HistoryWriter>,
    pub event_log: Arc<EventLogger>,
}

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub temperatures: Option<HashMap<String, f32>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateConversationBody {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Build the transport router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/events", get(last_events))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("transport listening on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    let conversation = match state
        .history
        .get_or_create(body.conversation_id.as_deref())
        .await
    {
        Ok(conversation) => conversation,
        Err(e) => return internal_error(e.to_string()),
    };

    let orchestrator = Orchestrator::new(state.deps.clone(), &state.settings);
    orchestrator
        .restore_leader_history(&conversation.messages)
        .await;

    let options = SessionOptions {
        temperatures: body.temperatures.unwrap_or_default(),
        conversation_id: Some(conversation.id.clone()),
        require_title_tool: conversation.messages.is_empty(),
    };

    state
        .writer
        .add_message(&conversation.id, StoredMessage::new("user", &body.message));

    let (tx, rx) = mpsc::unbounded_channel::<Result<String, std::convert::Infallible>>();
    let writer = Arc::clone(&state.writer);
    let conversation_id = conversation.id.clone();
    tokio::spawn(async move {
        let mut events = Box::pin(orchestrator.run_stream(body.message, options));
        let mut answer = String::new();
        while let Some(event) = events.next().await {
            match &event {
                StreamEvent::Token { content } => answer.push_str(content),
                StreamEvent::ConversationTitle { title } => {
                    writer.update_title(&conversation_id, title);
                }
                StreamEvent::Done => {
                    if !answer.is_empty() {
                        writer.add_message(
                            &conversation_id,
                            StoredMessage::new("assistant", &answer),
                        );
                    }
                }
                _ => {}
            }
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("transport: event serialization failed: {}", e);
                    continue;
                }
            };
            if tx.send(Ok(format!("{}\n", line))).is_err() {
                // Client went away; keep draining so persistence completes.
                log::debug!("transport: client disconnected mid-stream");
            }
        }
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| internal_error(e.to_string()))
}

async fn list_conversations(State(state): State<AppState>) -> Response {
    match state.history.list_summaries().await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    match state.history.create(body.title).await {
        Ok(conversation) => Json(conversation).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn get_conversation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.history.get(&id).await {
        Ok(Some(conversation)) => Json(conversation).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn delete_conversation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.history.delete(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn last_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state.event_log.read_all() {
        Ok(events) => {
            let limit = query.limit.unwrap_or(50);
            let start = events.len().saturating_sub(limit);
            Json(events[start..].to_vec()).into_response()
        }
        Err(e) => internal_error(e.to_string()),
    }
}

fn internal_error(message: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
