//! Command-line client: submit one query and print the answer as it is assembled.
//!
//! Configured through `TASKSTREAM_API_URL` and `TASKSTREAM_TOKEN`. Ctrl+C
//! cancels the stream.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use taskstream::api::{ApiClient, ClientConfig};
use taskstream::lifecycle::{SubmitRequest, TaskRunner};
use taskstream::start_taskstream::{self, USAGE};
use taskstream::transcript::{Category, SharedTranscript, extract_parameter_ranges};

const REFRESH: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    start_taskstream::init_tracing();

    let request = match start_taskstream::parse_submit_args(std::env::args().skip(1)) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(submit(request)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn submit(request: SubmitRequest) -> Result<()> {
    let config = ClientConfig::from_env().context("invalid client configuration")?;
    let client = Arc::new(ApiClient::new(config)?);
    let runner = TaskRunner::from_client(client, SharedTranscript::default())?;
    let handle = runner.submit(request).await?;

    let mut shown = String::new();
    let mut ticker = tokio::time::interval(REFRESH);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !handle.cancel_token().is_cancelled() => handle.cancel(),
            _ = ticker.tick() => {}
        }
        let content = runner
            .transcript()
            .read(|t| t.last().map(|m| m.content.clone()))
            .unwrap_or_default();
        render(&mut shown, content)?;
        if handle.is_finished() {
            break;
        }
    }

    let report = handle.join().await?;
    let content = runner
        .transcript()
        .read(|t| t.last().map(|m| m.content.clone()))
        .unwrap_or_default();
    render(&mut shown, content)?;
    println!();

    if let Some(error) = report.error {
        bail!("stream failed: {error}");
    }
    if report.cancelled {
        println!("[cancelled]");
        return Ok(());
    }

    let writer = report.handler;
    println!(
        "[task {} in conversation {}]",
        writer.task_id(),
        writer.conversation_id()
    );
    if writer.category() == Some(Category::Optimize) {
        for range in extract_parameter_ranges(&shown) {
            println!(
                "  {}: [{}, {}] start at {}",
                range.name, range.min, range.max, range.initial
            );
        }
    }
    Ok(())
}

/// Print what changed since the last refresh. A replaced answer is printed anew.
fn render(shown: &mut String, content: String) -> Result<()> {
    if content == *shown {
        return Ok(());
    }
    let mut out = std::io::stdout().lock();
    if let Some(delta) = content.strip_prefix(shown.as_str()) {
        write!(out, "{delta}")?;
    } else {
        write!(out, "\n{content}")?;
    }
    out.flush()?;
    *shown = content;
    Ok(())
}
