//! Reference task server.
//!
//! Speaks the same wire contract as a production task server:
//! - conversation and task creation
//! - task execution as an event stream
//! - task history, task listing and queue length

pub mod reply;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppState, ServerConfig};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8080;

/// Router with CORS and request tracing.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_server_with_shutdown(state, port, std::future::pending()).await
}

/// Start the HTTP server with graceful shutdown support.
///
/// The server will stop accepting new connections when `shutdown_signal` completes.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    port: u16,
    shutdown_signal: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("taskstream server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::api::{ApiClient, ClientConfig, PollingConfig};
    use crate::lifecycle::orchestrator::TaskBackend;
    use crate::lifecycle::runner::{SubmitRequest, TaskRunner};
    use crate::lifecycle::types::{TaskListQuery, TaskStatus, TaskType, partition_tasks};
    use crate::polling::PollStart;
    use crate::stream::SessionState;
    use crate::transcript::classify::extract_parameter_ranges;
    use crate::transcript::engine::SharedTranscript;
    use crate::transcript::message::{Category, MessageStatus};

    async fn start(config: ServerConfig) -> Arc<ApiClient> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(AppState::new(config))).await.unwrap();
        });
        let polling = PollingConfig {
            interval: Duration::from_millis(40),
            ..PollingConfig::default()
        };
        Arc::new(
            ApiClient::new(
                ClientConfig::default()
                    .with_base_url(format!("http://{addr}"))
                    .with_polling(polling),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_submit_end_to_end() {
        let client = start(ServerConfig::default().with_chunk_delay(Duration::from_millis(1))).await;
        let runner = TaskRunner::from_client(Arc::clone(&client), SharedTranscript::default()).unwrap();

        let handle = runner
            .submit(SubmitRequest::new("lighter bracket", TaskType::Optimize))
            .await
            .unwrap();
        let report = handle.join().await.unwrap();
        assert_eq!(report.state, SessionState::Closed);
        assert!(report.handler.finished());
        assert_eq!(report.handler.category(), Some(Category::Optimize));

        let answer = runner.transcript().read(|t| t.last().cloned()).unwrap();
        assert_eq!(answer.status, MessageStatus::Done);
        assert_eq!(answer.metadata.get("queue_position"), Some(&serde_json::json!(0)));
        let ranges = extract_parameter_ranges(&answer.content);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].name, "thickness");

        let task_id = report.handler.task_id().clone();
        let history = client.fetch_task_history(&task_id).await.unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[1].content, answer.content);

        let tasks = client
            .list_tasks(TaskListQuery::default().with_status(TaskStatus::Done))
            .await
            .unwrap();
        let partition = partition_tasks(tasks);
        assert_eq!(partition.completed.len(), 1);
        assert!(partition.in_flight.is_empty());
        assert_eq!(client.queue_length().await.unwrap().running, 0);
    }

    #[tokio::test]
    async fn test_cancelled_stream_recovers_by_polling() {
        let client = start(ServerConfig::default().with_chunk_delay(Duration::from_millis(30))).await;
        let runner = TaskRunner::from_client(Arc::clone(&client), SharedTranscript::default()).unwrap();

        let handle = runner
            .submit(SubmitRequest::new("box with a hole", TaskType::Geometry))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let report = handle.join().await.unwrap();
        assert!(report.cancelled);
        assert!(!report.handler.finished());

        let task_id = report.handler.task_id().clone();
        let start = runner
            .polling()
            .fetch_messages_for_task(&task_id, runner.transcript())
            .await
            .unwrap();
        assert_eq!(start, PollStart::Polling);

        for _ in 0..100 {
            if !runner.polling().is_polling(&task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!runner.polling().is_polling(&task_id));
        let last = runner.transcript().read(|t| t.last().cloned()).unwrap();
        assert_eq!(last.status, MessageStatus::Done);
        assert!(last.content.contains("cadquery"));
    }
}
