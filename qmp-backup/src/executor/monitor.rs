//! Block job completion tracking.
//!
//! The monitor owns the event feed on its own task and talks to the
//! executor through three things only:
//! - a one-shot completion signal, fired at most once
//! - a queue of classified events, drained by the executor
//! - a cancellation token, checked before every event

use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

use crate::qmp::{Event, EventStream, BLOCK_JOB_COMPLETED, BLOCK_JOB_ERROR};

/// A classified event.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The job reported an I/O error. It may still carry on.
    Error {
        device: Option<String>,
        payload: Value,
        hint: Option<String>,
    },

    /// The job on our device finished; `error` is set if it failed.
    Completed { error: Option<String> },

    /// Anything else, including completions of other devices' jobs
    Other { kind: String },
}

/// How the job ended, as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCompletion {
    Succeeded,
    Failed(String),
}

/// Why the watch loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    Completed,
    Cancelled,
    FeedClosed,
}

pub struct CompletionMonitor {
    device: String,
    backup_file: PathBuf,
    stop: CancellationToken,
    span: Span,
}

/// Executor side of a spawned monitor.
pub struct MonitorHandle {
    pub completion: oneshot::Receiver<JobCompletion>,
    pub job_events: mpsc::UnboundedReceiver<JobEvent>,
    stop: CancellationToken,
    task: JoinHandle<WatchEnd>,
}

impl CompletionMonitor {
    pub fn new(device: impl Into<String>, backup_file: impl Into<PathBuf>, stop: CancellationToken) -> Self {
        Self {
            device: device.into(),
            backup_file: backup_file.into(),
            stop,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run [`watch`](Self::watch) on its own task.
    pub fn spawn(self, mut events: EventStream) -> MonitorHandle {
        let (completion_tx, completion_rx) = oneshot::channel();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let stop = self.stop.clone();
        let span = self.span.clone();

        let task = tokio::spawn(
            async move { self.watch(&mut events, completion_tx, &job_tx).await }.instrument(span),
        );

        MonitorHandle {
            completion: completion_rx,
            job_events: job_rx,
            stop,
            task,
        }
    }

    /// Consume events until our job completes, the feed closes or `stop` is
    /// cancelled. An event still queued at cancellation is left in the feed.
    pub async fn watch(
        &self,
        events: &mut EventStream,
        completion: oneshot::Sender<JobCompletion>,
        job_events: &mpsc::UnboundedSender<JobEvent>,
    ) -> WatchEnd {
        let mut completion = Some(completion);

        loop {
            if self.stop.is_cancelled() {
                debug!("Completion monitor cancelled");
                return WatchEnd::Cancelled;
            }

            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("Completion monitor cancelled");
                    return WatchEnd::Cancelled;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                info!("Event feed closed");
                return WatchEnd::FeedClosed;
            };

            let classified = self.classify(&event);
            let finished = match &classified {
                JobEvent::Error { payload, hint, .. } => {
                    error!("Block job error: {}", payload);
                    if let Some(hint) = hint {
                        error!("{}", hint);
                    }
                    None
                }
                JobEvent::Completed { error: None } => {
                    info!("Block job on {} completed", self.device);
                    Some(JobCompletion::Succeeded)
                }
                JobEvent::Completed { error: Some(message) } => {
                    error!("Block job on {} completed with error: {}", self.device, message);
                    Some(JobCompletion::Failed(message.clone()))
                }
                JobEvent::Other { kind } => {
                    debug!("{}: {}", kind, event.data);
                    None
                }
            };

            // The executor may already be gone after cancellation.
            let _ = job_events.send(classified);

            if let Some(done) = finished {
                if let Some(signal) = completion.take() {
                    let _ = signal.send(done);
                }
                return WatchEnd::Completed;
            }
        }
    }

    fn classify(&self, event: &Event) -> JobEvent {
        match event.kind.as_str() {
            BLOCK_JOB_ERROR => {
                let text = format!("{}: {}", event.kind, event.data);
                let hint = text.contains("write").then(|| {
                    format!(
                        "If running a full backup, qcow2 image {} must be empty.",
                        self.backup_file.display()
                    )
                });
                JobEvent::Error {
                    device: event.device().map(str::to_string),
                    payload: event.data.clone(),
                    hint,
                }
            }
            BLOCK_JOB_COMPLETED if self.is_ours(event) => JobEvent::Completed {
                error: event
                    .data
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            _ => JobEvent::Other {
                kind: event.kind.clone(),
            },
        }
    }

    fn is_ours(&self, event: &Event) -> bool {
        event.device().map_or(true, |device| device == self.device)
    }
}

impl MonitorHandle {
    /// Stop the monitor and wait for its task to finish.
    pub async fn shutdown(self) -> Option<WatchEnd> {
        self.stop.cancel();
        match self.task.await {
            Ok(end) => Some(end),
            Err(e) => {
                error!("Completion monitor task failed: {}", e);
                None
            }
        }
    }
}
