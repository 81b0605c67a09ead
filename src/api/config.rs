//! Configuration for the task server client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::{ApiError, ApiResult};

/// Base URL used when nothing is configured.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Environment variable holding the base URL.
pub const ENV_API_URL: &str = "TASKSTREAM_API_URL";
/// Environment variable holding the bearer token.
pub const ENV_TOKEN: &str = "TASKSTREAM_TOKEN";
/// Environment variable holding the polling interval in seconds.
pub const ENV_POLL_INTERVAL: &str = "TASKSTREAM_POLL_INTERVAL_SECS";

/// Client configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the task server.
    pub api_base_url: String,
    /// Bearer token attached to every call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Timeout of JSON calls. The stream read loop has none.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Connection timeout.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Endpoint paths.
    pub endpoints: EndpointConfig,
    /// Polling fallback settings.
    pub polling: PollingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            endpoints: EndpointConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the JSON call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the polling settings.
    #[must_use]
    pub const fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    /// Read the configuration from the process environment.
    ///
    /// # Errors
    /// Returns an error if a variable is set but invalid.
    pub fn from_env() -> ApiResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from a key lookup.
    ///
    /// # Errors
    /// Returns an error if a value is present but invalid.
    pub fn from_lookup<F>(lookup: F) -> ApiResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_API_URL).filter(|url| !url.trim().is_empty()) {
            config.api_base_url = url.trim().to_string();
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|token| !token.is_empty()) {
            config.auth_token = Some(token);
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|err| ApiError::Config(format!("{ENV_POLL_INTERVAL}={raw}: {err}")))?;
            config.polling.interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// Returns an error for an unparsable base URL or a zero interval.
    pub fn validate(&self) -> ApiResult<()> {
        let url = self.base_url()?;
        if url.cannot_be_a_base() {
            return Err(ApiError::Config(format!(
                "base URL cannot be a base: {}",
                self.api_base_url
            )));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ApiError::Config("timeouts must be non-zero".to_string()));
        }
        self.polling.validate()
    }

    /// Parsed base URL.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse.
    pub fn base_url(&self) -> ApiResult<Url> {
        Ok(Url::parse(&self.api_base_url)?)
    }

    /// Absolute URL of an endpoint path.
    ///
    /// # Errors
    /// Returns an error if the base URL or the path does not parse.
    pub fn endpoint_url(&self, path: &str) -> ApiResult<Url> {
        let mut base = self.base_url()?;
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        Ok(base.join(path.trim_start_matches('/'))?)
    }
}

/// Endpoint paths, relative to the base URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Create a conversation.
    pub create_conversation: String,
    /// Create a task.
    pub create_task: String,
    /// Execute a task as an event stream.
    pub execute: String,
    /// Fetch the messages of one task.
    pub task_history: String,
    /// List tasks.
    pub task_list: String,
    /// Optimization queue length.
    pub queue_length: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            create_conversation: "/geometry/conversation".to_string(),
            create_task: "/tasks/create".to_string(),
            execute: "/tasks/execute".to_string(),
            task_history: "/chat/task".to_string(),
            task_list: "/tasks/list".to_string(),
            queue_length: "/tasks/optimize/queue_length".to_string(),
        }
    }
}

/// Polling fallback settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval between fetches.
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Interval once fetches keep failing.
    #[serde(with = "duration_serde")]
    pub degraded_interval: Duration,
    /// Consecutive failures before switching to the degraded interval.
    pub degrade_after_failures: u32,
    /// Consecutive failures before the loop gives up (0 = never).
    pub max_consecutive_failures: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            degraded_interval: Duration::from_secs(10),
            degrade_after_failures: 3,
            max_consecutive_failures: 20,
        }
    }
}

impl PollingConfig {
    /// Interval to wait after `failures` consecutive failed fetches.
    #[must_use]
    pub fn interval_after(&self, failures: u32) -> Duration {
        if failures >= self.degrade_after_failures.max(1) {
            self.degraded_interval
        } else {
            self.interval
        }
    }

    /// Whether the loop should give up after `failures` consecutive failures.
    #[must_use]
    pub const fn gives_up_after(&self, failures: u32) -> bool {
        self.max_consecutive_failures != 0 && failures >= self.max_consecutive_failures
    }

    /// Check the settings.
    ///
    /// # Errors
    /// Returns an error for a zero interval.
    pub fn validate(&self) -> ApiResult<()> {
        if self.interval.is_zero() || self.degraded_interval.is_zero() {
            return Err(ApiError::Config("polling intervals must be non-zero".to_string()));
        }
        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
