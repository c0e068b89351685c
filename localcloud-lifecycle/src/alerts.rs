//! Alert bus.
//!
//! Components publish [`Alert`]s describing health transitions, restart
//! decisions and resource pressure. The bus holds a bounded queue: publishing
//! never blocks, and when the queue is full the oldest buffered alert is
//! dropped to make room. Every alert is also emitted as a `tracing` event.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::DEFAULT_ALERT_CAPACITY;

/// Category of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    HealthCheck,
    ResourceLimit,
    RestartRequired,
    RecoveryFailed,
    Restarted,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HealthCheck => "health_check",
            AlertKind::ResourceLimit => "resource_limit",
            AlertKind::RestartRequired => "restart_required",
            AlertKind::RecoveryFailed => "recovery_failed",
            AlertKind::Restarted => "restarted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub service: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub suggested_action: Option<String>,
}

impl Alert {
    /// Create a new alert with the current timestamp
    pub fn new(
        service: impl Into<String>,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            suggested_action: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.severity.as_str(),
            self.service,
            self.kind.as_str(),
            self.message
        )
    }
}

struct Shared {
    queue: Mutex<VecDeque<Alert>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Bounded, overflow-dropping alert queue. Cheap to clone.
#[derive(Clone)]
pub struct AlertBus {
    shared: Arc<Shared>,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

impl fmt::Debug for AlertBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertBus")
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl AlertBus {
    /// Create a bus holding at most `capacity` alerts (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish an alert. Never blocks; evicts the oldest alert when full.
    pub fn send(&self, alert: Alert) {
        log_alert(&alert);

        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(alert);
        }
        self.shared.notify.notify_one();
    }

    /// Shorthand for building and publishing an alert.
    pub fn emit(
        &self,
        service: &str,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) {
        self.send(Alert::new(service, kind, severity, message));
    }

    /// A new draining handle on the shared queue.
    pub fn receiver(&self) -> AlertReceiver {
        AlertReceiver {
            shared: self.shared.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of alerts evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting alerts and wake all waiting receivers.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Draining side of an [`AlertBus`]. Each alert is delivered to exactly one receiver.
#[derive(Clone)]
pub struct AlertReceiver {
    shared: Arc<Shared>,
}

impl AlertReceiver {
    /// Wait for the next alert. Returns `None` once the bus is closed and drained.
    pub async fn recv(&self) -> Option<Alert> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(alert) = self.try_recv() {
                return Some(alert);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<Alert> {
        self.shared.queue.lock().pop_front()
    }

    /// Take everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<Alert> {
        self.shared.queue.lock().drain(..).collect()
    }
}

fn log_alert(alert: &Alert) {
    let service = alert.service.as_str();
    let kind = alert.kind.as_str();
    match alert.severity {
        AlertSeverity::Info => info!(service, kind, "{}", alert.message),
        AlertSeverity::Warning => warn!(service, kind, "{}", alert.message),
        AlertSeverity::Critical => error!(service, kind, "{}", alert.message),
    }
}
