//! Polling fallback for tasks left in progress without a live stream.
//!
//! One loop per task id. Each loop holds the polling writer lease of its
//! transcript, so it stops writing the moment a stream takes over.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiResult, PollingConfig};
use crate::lifecycle::ids::TaskId;
use crate::lifecycle::orchestrator::TaskBackend;
use crate::transcript::engine::{MessageUpdate, SharedTranscript, WriterKind, WriterLease};
use crate::transcript::message::{Message, MessageStatus};

/// Outcome of [`PollingSupervisor::fetch_messages_for_task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStart {
    /// The last agent message is in progress; a loop now polls it.
    Polling,
    /// The fetched transcript is settled; no loop was started.
    Settled,
    /// A stream owns the transcript; nothing was fetched.
    StreamActive,
    /// Another polling loop owns the transcript; nothing was fetched.
    Busy,
}

struct PollLoop {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs at most one polling loop per task.
pub struct PollingSupervisor<B: ?Sized> {
    backend: Arc<B>,
    config: PollingConfig,
    loops: Arc<DashMap<TaskId, PollLoop>>,
    /// Serializes stop, fetch and spawn per task.
    starts: DashMap<TaskId, Arc<Mutex<()>>>,
    generation: AtomicU64,
}

impl<B: TaskBackend + ?Sized + 'static> PollingSupervisor<B> {
    /// Create a supervisor.
    #[must_use]
    pub fn new(backend: Arc<B>, config: PollingConfig) -> Self {
        Self {
            backend,
            config,
            loops: Arc::new(DashMap::new()),
            starts: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Fetch the messages of `task_id` into `transcript`, then poll while the
    /// last agent message is in progress.
    ///
    /// Any loop already running for the task is stopped first. Concurrent
    /// calls for the same task run one after the other.
    ///
    /// # Errors
    /// Returns the error of the initial fetch.
    pub async fn fetch_messages_for_task(
        &self,
        task_id: &TaskId,
        transcript: &SharedTranscript,
    ) -> ApiResult<PollStart> {
        let start = Arc::clone(self.starts.entry(task_id.clone()).or_default().value());
        let _serial = start.lock().await;
        self.stop(task_id).await;

        let Some(lease) = transcript.try_acquire_writer(WriterKind::Polling) else {
            let start = if transcript.writer() == Some(WriterKind::Stream) {
                PollStart::StreamActive
            } else {
                PollStart::Busy
            };
            debug!(%task_id, ?start, "transcript not available for polling");
            return Ok(start);
        };

        let history = self.backend.fetch_task_history(task_id).await?;
        let in_progress = last_agent_in_progress(&history.messages);
        if !lease.replace_all(history.messages) {
            return Ok(PollStart::StreamActive);
        }
        if !in_progress {
            debug!(%task_id, "task history settled");
            return Ok(PollStart::Settled);
        }

        self.spawn_loop(task_id.clone(), lease);
        Ok(PollStart::Polling)
    }

    fn spawn_loop(&self, task_id: TaskId, lease: WriterLease) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let worker = PollWorker {
            backend: Arc::clone(&self.backend),
            config: self.config,
            task_id: task_id.clone(),
            lease,
            cancel: cancel.clone(),
        };
        let loops = Arc::clone(&self.loops);
        let key = task_id.clone();
        let task = tokio::spawn(async move {
            worker.run().await;
            loops.remove_if(&key, |_, entry| entry.generation == generation);
        });

        info!(%task_id, generation, "polling started");
        let displaced = self.loops.insert(
            task_id.clone(),
            PollLoop {
                generation,
                cancel,
                task,
            },
        );
        if let Some(old) = displaced {
            warn!(%task_id, generation = old.generation, "displaced polling loop cancelled");
            old.cancel.cancel();
        }
    }

    /// Stop the loop for `task_id` and wait for it to exit.
    pub async fn stop(&self, task_id: &TaskId) {
        if let Some((_, entry)) = self.loops.remove(task_id) {
            entry.cancel.cancel();
            if let Err(err) = entry.task.await {
                warn!(%task_id, %err, "polling loop ended abnormally");
            }
            debug!(%task_id, "polling stopped");
        }
    }

    /// Stop every loop.
    pub async fn stop_all(&self) {
        let ids: Vec<TaskId> = self.loops.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Whether a loop is running for `task_id`.
    #[must_use]
    pub fn is_polling(&self, task_id: &TaskId) -> bool {
        self.loops
            .get(task_id)
            .is_some_and(|entry| !entry.task.is_finished())
    }

    /// Number of running loops.
    #[must_use]
    pub fn active_loops(&self) -> usize {
        self.loops
            .iter()
            .filter(|entry| !entry.task.is_finished())
            .count()
    }
}

fn last_agent_in_progress(messages: &[Message]) -> bool {
    messages
        .last()
        .is_some_and(|message| message.is_agent() && message.status == MessageStatus::InProgress)
}

struct PollWorker<B: ?Sized> {
    backend: Arc<B>,
    config: PollingConfig,
    task_id: TaskId,
    lease: WriterLease,
    cancel: CancellationToken,
}

impl<B: TaskBackend + ?Sized> PollWorker<B> {
    async fn run(self) {
        let mut failures = 0_u32;
        loop {
            let wait = self.config.interval_after(failures);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
            if !self.lease.is_current() {
                debug!(task_id = %self.task_id, "polling lease revoked");
                break;
            }

            let fetched = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                fetched = self.backend.fetch_task_history(&self.task_id) => fetched,
            };
            match fetched {
                Ok(history) => {
                    failures = 0;
                    let in_progress = last_agent_in_progress(&history.messages);
                    if !self.apply(history.messages) {
                        break;
                    }
                    if !in_progress {
                        info!(task_id = %self.task_id, "task settled, polling finished");
                        break;
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(task_id = %self.task_id, failures, %err, "polling fetch failed");
                    if self.config.gives_up_after(failures) {
                        warn!(task_id = %self.task_id, "giving up polling");
                        break;
                    }
                }
            }
        }
    }

    /// Refresh the last agent message, or reinstall the transcript when the
    /// shapes no longer line up. Returns false once the lease is revoked.
    fn apply(&self, mut messages: Vec<Message>) -> bool {
        let same_shape = self
            .lease
            .with_transcript(|transcript| transcript.len() == messages.len())
            .unwrap_or(false);
        match messages.pop() {
            Some(last) if same_shape && last.is_agent() => {
                self.lease.update_last(MessageUpdate::Refresh(last)).is_applied()
            }
            Some(last) => {
                messages.push(last);
                self.lease.replace_all(messages)
            }
            None => self.lease.replace_all(messages),
        }
    }
}
