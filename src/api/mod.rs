//! HTTP client for the task server.
//!
//! Implements [`TaskBackend`] over reqwest and builds the requests the
//! streaming transport sends. JSON calls carry the configured timeout; the
//! shared client itself has none, so stream reads are not cut short.

pub mod config;
pub mod error;

pub use config::{ClientConfig, EndpointConfig, PollingConfig};
pub use error::{ApiError, ApiResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::lifecycle::ids::{ConversationId, TaskId};
use crate::lifecycle::orchestrator::TaskBackend;
use crate::lifecycle::types::{
    Conversation, CreateConversation, CreateTask, QueueLength, Task, TaskHistory, TaskListQuery,
    TaskStatus, TaskType,
};
use crate::stream::{StreamRequest, StreamTransport};

const ERROR_BODY_LIMIT: usize = 512;

/// Task server client.
#[derive(Clone, Debug)]
pub struct ApiClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a client.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> ApiResult<Self> {
        config.validate()?;
        let http = Self::build_client(&config)?;
        Ok(Self { config, http })
    }

    /// Create a client with default configuration.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_defaults() -> ApiResult<Self> {
        Self::new(ClientConfig::default())
    }

    fn build_client(config: &ClientConfig) -> ApiResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(concat!("taskstream/", env!("CARGO_PKG_VERSION"))) {
            headers.insert(USER_AGENT, agent);
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .gzip(true)
            .build()
            .map_err(|e| ApiError::HttpClient(e.to_string()))
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A stream transport sharing this client's connection pool.
    #[must_use]
    pub fn transport(&self) -> StreamTransport {
        StreamTransport::new(self.http.clone())
    }

    /// Build the execute request for `body`.
    ///
    /// # Errors
    /// Returns an error if the execute URL does not parse.
    pub fn stream_request(&self, body: Value) -> ApiResult<StreamRequest> {
        let url = self.config.endpoint_url(&self.config.endpoints.execute)?;
        let request = StreamRequest::new(url, body);
        Ok(match &self.config.auth_token {
            Some(token) => request.with_bearer(token.clone()),
            None => request,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> ApiResult<T> {
        let mut builder = builder.timeout(self.config.request_timeout);
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::HttpRequest(err)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Create-task response. Fields the server omits come from the request.
#[derive(Deserialize)]
struct CreatedTask {
    task_id: Option<TaskId>,
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    task_type: Option<TaskType>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    details: Option<Value>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskListResponse {
    Bare(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

#[async_trait]
impl TaskBackend for ApiClient {
    async fn create_conversation(&self, request: CreateConversation) -> ApiResult<Conversation> {
        let url = self
            .config
            .endpoint_url(&self.config.endpoints.create_conversation)?;
        debug!(%url, correlation = %request.conversation_id, "creating conversation");
        self.send_json(self.http.post(url).json(&request)).await
    }

    async fn create_task(&self, request: CreateTask) -> ApiResult<Task> {
        let url = self.config.endpoint_url(&self.config.endpoints.create_task)?;
        debug!(%url, conversation_id = %request.conversation_id, "creating task");
        let created: CreatedTask = self.send_json(self.http.post(url).json(&request)).await?;
        Ok(Task {
            task_id: created.task_id.ok_or(ApiError::MissingField("task_id"))?,
            conversation_id: created.conversation_id.unwrap_or(request.conversation_id),
            task_type: created.task_type.unwrap_or(request.task_type),
            status: created.status.unwrap_or_default(),
            details: created
                .details
                .or_else(|| serde_json::to_value(&request.details).ok()),
            created_at: created.created_at,
        })
    }

    async fn fetch_task_history(&self, task_id: &TaskId) -> ApiResult<TaskHistory> {
        let mut url = self.config.endpoint_url(&self.config.endpoints.task_history)?;
        url.query_pairs_mut().append_pair("task_id", task_id.as_str());
        debug!(%url, "fetching task history");
        self.send_json(self.http.get(url)).await
    }

    async fn list_tasks(&self, query: TaskListQuery) -> ApiResult<Vec<Task>> {
        let url = self.config.endpoint_url(&self.config.endpoints.task_list)?;
        debug!(%url, ?query, "listing tasks");
        let response: TaskListResponse = self.send_json(self.http.post(url).json(&query)).await?;
        Ok(match response {
            TaskListResponse::Bare(tasks) | TaskListResponse::Wrapped { tasks } => tasks,
        })
    }

    async fn queue_length(&self) -> ApiResult<QueueLength> {
        let url = self.config.endpoint_url(&self.config.endpoints.queue_length)?;
        self.send_json(self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Query;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::{get, post};
    use axum::Json;
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> ClientConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ClientConfig::default()
            .with_base_url(format!("http://{addr}"))
            .with_token("tok")
    }

    #[tokio::test]
    async fn test_create_task_fills_missing_fields() {
        let router = Router::new().route(
            "/tasks/create",
            post(|headers: AxumHeaders| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"task_id": 7, "auth": auth}))
            }),
        );
        let client = ApiClient::new(serve(router).await).unwrap();

        let task = client
            .create_task(CreateTask {
                conversation_id: "c-1".into(),
                task_type: TaskType::Optimize,
                details: crate::lifecycle::types::TaskDetails::default(),
            })
            .await
            .unwrap();
        assert_eq!(task.task_id.as_str(), "7");
        assert_eq!(task.conversation_id.as_str(), "c-1");
        assert_eq!(task.task_type, TaskType::Optimize);
    }

    #[tokio::test]
    async fn test_status_error_and_history_query() {
        let router = Router::new()
            .route("/tasks/optimize/queue_length", get(|| async { StatusCode::BAD_GATEWAY }))
            .route(
                "/chat/task",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    Json(json!({"message": [
                        {"role": "user", "content": params.get("task_id").cloned().unwrap_or_default()}
                    ]}))
                }),
            );
        let client = ApiClient::new(serve(router).await).unwrap();

        let err = client.queue_length().await.unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert!(err.is_retryable());

        let history = client.fetch_task_history(&TaskId::from("t-42")).await.unwrap();
        assert_eq!(history.messages[0].content, "t-42");
    }

    #[tokio::test]
    async fn test_list_tasks_accepts_wrapped_response() {
        let router = Router::new().route(
            "/tasks/list",
            post(|Json(query): Json<TaskListQuery>| async move {
                Json(json!({"tasks": [{
                    "task_id": "t-1",
                    "conversation_id": "c-1",
                    "task_type": "geometry",
                    "status": query.status.map_or("queued".to_string(), |s| s.to_string())
                }]}))
            }),
        );
        let client = ApiClient::new(serve(router).await).unwrap();

        let tasks = client
            .list_tasks(TaskListQuery::default().with_status(TaskStatus::Done))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Done);
    }

    #[test]
    fn test_stream_request_carries_token() {
        let client = ApiClient::new(ClientConfig::default().with_token("abc")).unwrap();
        let request = client.stream_request(json!({"query": "q"})).unwrap();
        assert_eq!(request.url.as_str(), "http://127.0.0.1:8080/tasks/execute");
        assert_eq!(request.bearer.as_deref(), Some("abc"));
    }
}
