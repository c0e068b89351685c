//! Progress events for bulk start/stop operations

use std::fmt;

use tokio::sync::mpsc;

/// Default progress channel capacity
pub const PROGRESS_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePhase {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed { message: String },
}

impl ServicePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServicePhase::Starting => "starting",
            ServicePhase::Started => "started",
            ServicePhase::Stopping => "stopping",
            ServicePhase::Stopped => "stopped",
            ServicePhase::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub service: String,
    pub phase: ServicePhase,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.phase {
            ServicePhase::Failed { message } => write!(f, "{}: failed ({})", self.service, message),
            phase => write!(f, "{}: {}", self.service, phase.as_str()),
        }
    }
}

/// Sends progress events to whoever started the operation.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget: a closed receiver is ignored.
    pub async fn send(&self, service: &str, phase: ServicePhase) {
        let _ = self
            .tx
            .send(ProgressEvent {
                service: service.to_string(),
                phase,
            })
            .await;
    }
}

/// Create a progress sender and the receiver that observes it.
pub fn progress_channel() -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
    (ProgressSender::new(tx), rx)
}

pub(crate) async fn emit(progress: &Option<ProgressSender>, service: &str, phase: ServicePhase) {
    if let Some(sender) = progress {
        sender.send(service, phase).await;
    }
}
