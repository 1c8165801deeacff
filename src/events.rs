//! Per-job event bus: status, progress and image-available notifications.
//!
//! Each job owns one Tokio `broadcast` channel. The bus only republishes
//! state the [`crate::job::Job`] already holds; it never owns any of it.
//! Publishing a terminal status event drops the sender, so every
//! subscription ends cleanly after it has drained the final event.
//!
//! Consumers pick one of two shapes:
//!
//! * [`JobSubscription`]: a `Stream<Item = JobEvent>`, the natural fit for
//!   a server-sent-events endpoint.
//! * [`JobEventHandler`]: callbacks, registered with
//!   [`crate::PageQueue::subscribe_with`] and removed with
//!   [`crate::PageQueue::unsubscribe`].

use crate::job::{JobProgress, JobSnapshot, JobStatus, ProcessedImage};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// A push update about one job.
///
/// Serialised as `{"type": "status" | "progress" | "image" | "error", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    Status {
        job_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Progress {
        job_id: String,
        progress: JobProgress,
    },
    Image {
        job_id: String,
        image: ProcessedImage,
    },
    Error {
        job_id: String,
        message: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Status { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Image { job_id, .. }
            | JobEvent::Error { job_id, .. } => job_id,
        }
    }

    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "status",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Image { .. } => "image",
            JobEvent::Error { .. } => "error",
        }
    }

    /// True for the last event a job will ever publish.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Status { status, .. } if status.is_terminal())
    }

    /// Render as one server-sent-events frame.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!("event: {}\ndata: {}\n\n", self.kind(), data))
    }
}

/// Callbacks for push-style consumers.
///
/// All methods default to no-ops; implementations override what they need.
/// Handlers run on a Tokio task, one event at a time, in publish order.
pub trait JobEventHandler: Send + Sync {
    fn on_status(&self, job_id: &str, status: JobStatus, error: Option<&str>) {
        let _ = (job_id, status, error);
    }

    fn on_progress(&self, job_id: &str, progress: &JobProgress) {
        let _ = (job_id, progress);
    }

    fn on_image(&self, job_id: &str, image: &ProcessedImage) {
        let _ = (job_id, image);
    }

    fn on_error(&self, job_id: &str, message: &str) {
        let _ = (job_id, message);
    }

    /// Dispatch an event to the method above matching its type.
    fn on_event(&self, event: &JobEvent) {
        match event {
            JobEvent::Status {
                job_id,
                status,
                error,
            } => self.on_status(job_id, *status, error.as_deref()),
            JobEvent::Progress { job_id, progress } => self.on_progress(job_id, progress),
            JobEvent::Image { job_id, image } => self.on_image(job_id, image),
            JobEvent::Error { job_id, message } => self.on_error(job_id, message),
        }
    }
}

/// Handler that ignores everything.
pub struct NoopEventHandler;

impl JobEventHandler for NoopEventHandler {}

/// Shared handler type accepted by [`crate::PageQueue::subscribe_with`].
pub type EventHandler = Arc<dyn JobEventHandler>;

/// Token returned by `subscribe_with`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// The channel of one job plus its registered callback forwarders.
pub(crate) struct EventBus {
    sender: Option<broadcast::Sender<JobEvent>>,
    handlers: HashMap<SubscriptionId, AbortHandle>,
    next_handler: u64,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Some(sender),
            handlers: HashMap::new(),
            next_handler: 0,
        }
    }

    /// Publish to current subscribers; closes the channel after a terminal event.
    pub(crate) fn publish(&mut self, event: JobEvent) {
        let terminal = event.is_terminal();
        if let Some(sender) = &self.sender {
            // No receivers is fine: callers may poll instead.
            let _ = sender.send(event);
        }
        if terminal {
            self.sender = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// A receiver for future events, or `None` once closed.
    pub(crate) fn receiver(&self) -> Option<broadcast::Receiver<JobEvent>> {
        self.sender.as_ref().map(|s| s.subscribe())
    }

    pub(crate) fn add_handler(&mut self, handle: AbortHandle) -> SubscriptionId {
        self.next_handler += 1;
        let id = SubscriptionId(self.next_handler);
        self.handlers.insert(id, handle);
        id
    }

    pub(crate) fn remove_handler(&mut self, id: SubscriptionId) -> bool {
        match self.handlers.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for (_, handle) in self.handlers.drain() {
            handle.abort();
        }
    }
}

/// A live feed of one job's events.
///
/// Carries the snapshot taken at the instant of subscribing, so no event
/// between "read state" and "start listening" is lost. The stream ends after
/// the terminal status event, or immediately if the job had already finished.
pub struct JobSubscription {
    snapshot: JobSnapshot,
    events: Pin<Box<dyn Stream<Item = JobEvent> + Send>>,
}

impl JobSubscription {
    pub(crate) fn new(snapshot: JobSnapshot, receiver: Option<broadcast::Receiver<JobEvent>>) -> Self {
        let job_id = snapshot.id.clone();
        let events: Pin<Box<dyn Stream<Item = JobEvent> + Send>> = match receiver {
            Some(rx) => Box::pin(BroadcastStream::new(rx).filter_map(move |item| {
                let job_id = job_id.clone();
                async move {
                    match item {
                        Ok(event) => Some(event),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!("Subscriber for job {} lagged; {} events dropped", job_id, skipped);
                            None
                        }
                    }
                }
            })),
            None => Box::pin(futures::stream::empty()),
        };
        Self { snapshot, events }
    }

    /// Job state at the moment of subscribing.
    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }
}

impl Stream for JobSubscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        self.events.as_mut().poll_next(cx)
    }
}
