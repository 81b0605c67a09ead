//! Startup helpers for the taskstream binaries.

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::runner::SubmitRequest;
use crate::lifecycle::types::TaskType;
use crate::server::{self, AppState, ServerConfig};

/// Port variable of the reference server.
pub const ENV_PORT: &str = "TASKSTREAM_PORT";

/// Chunk delay variable of the reference server, in milliseconds.
pub const ENV_CHUNK_DELAY: &str = "TASKSTREAM_CHUNK_DELAY_MS";

/// Usage of the command-line client.
pub const USAGE: &str =
    "usage: taskstream [--type geometry|optimize|retrieval] [--file URL NAME] [--user NAME] QUERY...";

/// Install the fmt subscriber, filtered by `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the reference server until Ctrl+C.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    init_tracing();
    tracing::info!("Starting taskstream server v{}", env!("CARGO_PKG_VERSION"));

    let state = initialize();
    let port = get_port();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    };
    if let Err(e) = rt.block_on(run_server_with_shutdown(state, port, shutdown)) {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Build the server state from the environment.
#[must_use]
pub fn initialize() -> Arc<AppState> {
    let mut config = ServerConfig::default();
    if let Some(delay) = parse_number::<u64>(std::env::var(ENV_CHUNK_DELAY).ok()) {
        config = config.with_chunk_delay(Duration::from_millis(delay));
    }
    tracing::info!(chunk_delay = ?config.chunk_delay, "server configured");
    AppState::new(config)
}

/// Run server with graceful shutdown.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    port: u16,
    shutdown_signal: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    server::run_server_with_shutdown(state, port, shutdown_signal).await
}

/// Get configured server port.
#[must_use]
pub fn get_port() -> u16 {
    parse_number(std::env::var(ENV_PORT).ok()).unwrap_or(server::DEFAULT_PORT)
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|value| value.trim().parse().ok())
}

/// Parse the client's arguments, program name excluded.
///
/// # Errors
/// Returns a message for unknown flags, missing values or an empty query.
pub fn parse_submit_args<I>(args: I) -> Result<SubmitRequest, String>
where
    I: IntoIterator<Item = String>,
{
    let mut task_type = TaskType::Geometry;
    let mut file = None;
    let mut user = None;
    let mut words = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--type" | "-t" => {
                let value = args.next().ok_or("--type needs a value")?;
                task_type = value.parse()?;
            }
            "--file" => {
                let url = args.next().ok_or("--file needs a URL")?;
                let name = args.next().ok_or("--file needs a name")?;
                file = Some((url, name));
            }
            "--user" => user = Some(args.next().ok_or("--user needs a value")?),
            "--" => words.extend(args.by_ref()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            _ => words.push(arg),
        }
    }

    let query = words.join(" ");
    if query.trim().is_empty() {
        return Err("missing query".to_string());
    }
    let mut request = SubmitRequest::new(query, task_type);
    if let Some((url, name)) = file {
        request = request.with_file(url, name);
    }
    if let Some(user) = user {
        request = request.with_user(user);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_submit_args() {
        let request = parse_submit_args(args(&[
            "--type", "optimize", "--file", "http://f/a.step", "a.step", "make", "it", "lighter",
        ]))
        .unwrap();
        assert_eq!(request.task_type, TaskType::Optimize);
        assert_eq!(request.query, "make it lighter");
        assert_eq!(request.file_name.as_deref(), Some("a.step"));
        assert_eq!(request.user, "anonymous");
    }

    #[test]
    fn test_parse_submit_args_errors() {
        assert!(parse_submit_args(args(&[])).is_err());
        assert!(parse_submit_args(args(&["--type"])).is_err());
        assert!(parse_submit_args(args(&["--type", "bogus", "q"])).is_err());
        assert!(parse_submit_args(args(&["--verbose", "q"])).is_err());
        let dashed = parse_submit_args(args(&["--", "--type", "is", "text"])).unwrap();
        assert_eq!(dashed.query, "--type is text");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<u16>(Some(" 9090 ".into())), Some(9090));
        assert_eq!(parse_number::<u16>(Some("x".into())), None);
        assert_eq!(parse_number::<u16>(None), None);
    }
}
