//! HTTP route handlers of the reference task server.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::lifecycle::ids::{ConversationId, TaskId};
use crate::lifecycle::types::{
    Conversation, CreateConversation, CreateTask, QueueLength, Task, TaskHistory, TaskListQuery,
    TaskType,
};

use super::reply::ReplyScript;
use super::state::AppState;

type ApiFailure = (StatusCode, String);

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let endpoints = state.config().endpoints.clone();
    Router::new()
        .route("/health", get(health_check))
        .route(&endpoints.create_conversation, post(create_conversation))
        .route(&endpoints.create_task, post(create_task))
        .route(&endpoints.execute, post(execute))
        .route(&endpoints.task_history, get(task_history))
        .route(&endpoints.task_list, post(task_list))
        .route(&endpoints.queue_length, get(queue_length))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskstream",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateConversation>,
) -> Json<Conversation> {
    Json(state.create_conversation(request))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTask>,
) -> Result<Json<Task>, ApiFailure> {
    let conversation_id = request.conversation_id.clone();
    state.create_task(request).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("unknown conversation {conversation_id}"),
        )
    })
}

/// Body of the execute call.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// User query.
    pub query: String,
    /// Conversation of the task.
    pub conversation_id: ConversationId,
    /// Task to run.
    pub task_id: TaskId,
    /// Kind of task.
    pub task_type: TaskType,
    /// Submitting user.
    #[serde(default)]
    pub user: Option<String>,
    /// Uploaded file.
    #[serde(default)]
    pub file_url: Option<String>,
}

/// Stream the reply as an event stream.
///
/// The reply is produced by a detached task, so the execution completes and
/// the history settles even when the client goes away.
async fn execute(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Response, ApiFailure> {
    let queue_ahead = state.queue_length().running;
    let Some(task_type) = state.begin_execution(&request.task_id, &request.query) else {
        return Err((
            StatusCode::NOT_FOUND,
            format!("unknown task {}", request.task_id),
        ));
    };
    info!(
        task_id = %request.task_id,
        %task_type,
        user = request.user.as_deref().unwrap_or("anonymous"),
        file = ?request.file_url,
        "execution started"
    );

    let script = ReplyScript::new(
        &request.conversation_id,
        &request.task_id,
        task_type,
        &request.query,
        queue_ahead,
    );
    let (tx, rx) = mpsc::channel::<String>(16);
    tokio::spawn(produce(state, request.task_id, script, tx));

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    }));
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn produce(state: Arc<AppState>, task_id: TaskId, script: ReplyScript, tx: mpsc::Sender<String>) {
    let delay = state.config().chunk_delay;
    let mut connected = tx.send(script.info.encode()).await.is_ok();

    for text in &script.deltas {
        tokio::time::sleep(delay).await;
        state.append_progress(&task_id, text);
        if connected {
            connected = tx.send(ReplyScript::delta_frame(text).encode()).await.is_ok();
            if !connected {
                debug!(%task_id, "client disconnected, finishing in the background");
            }
        }
    }

    tokio::time::sleep(delay).await;
    let metadata = script
        .end
        .data
        .get("metadata")
        .and_then(|value| value.as_object())
        .cloned()
        .unwrap_or_default();
    state.finish_execution(&task_id, &script.answer, metadata);
    if connected {
        let _ = tx.send(script.end.encode()).await;
    }
    info!(%task_id, "execution finished");
}

async fn task_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<TaskHistory>, ApiFailure> {
    let task_id = params
        .get("task_id")
        .map(|id| TaskId::new(id.clone()))
        .ok_or((StatusCode::BAD_REQUEST, "missing task_id".to_string()))?;
    state
        .history(&task_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown task {task_id}")))
}

async fn task_list(
    State(state): State<Arc<AppState>>,
    Json(query): Json<TaskListQuery>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tasks": state.list(&query) }))
}

async fn queue_length(State(state): State<Arc<AppState>>) -> Json<QueueLength> {
    Json(state.queue_length())
}
