//! Async utilities to wait for alerts and state transitions

use std::time::Duration;

use localcloud_lifecycle::{Alert, AlertReceiver, Orchestrator, ServiceStatus};
use tokio::time::{sleep, timeout_at, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Wait operation timed out")]
    Timeout,

    #[error("Service not found")]
    ServiceNotFound,

    #[error("Alert bus closed")]
    Closed,
}

/// Receive alerts until one matches `predicate`; non-matching alerts are discarded.
pub async fn wait_for_alert<F>(
    receiver: &AlertReceiver,
    predicate: F,
    timeout: Duration,
) -> Result<Alert, WaitError>
where
    F: Fn(&Alert) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        match timeout_at(deadline, receiver.recv()).await {
            Ok(Some(alert)) if predicate(&alert) => return Ok(alert),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(WaitError::Closed),
            Err(_) => return Err(WaitError::Timeout),
        }
    }
}

/// Poll `condition` until it holds.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> Result<(), WaitError>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        sleep(POLL_INTERVAL).await;
    }
    if condition() { Ok(()) } else { Err(WaitError::Timeout) }
}

/// Wait for a service to reach a specific status
pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    service: &str,
    expected: ServiceStatus,
    timeout: Duration,
) -> Result<(), WaitError> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let status = orchestrator
            .service(service)
            .ok_or(WaitError::ServiceNotFound)?
            .status;
        if status == expected {
            return Ok(());
        }
        sleep(POLL_INTERVAL).await;
    }
    Err(WaitError::Timeout)
}

/// Wait for the health monitor to report a service unhealthy
pub async fn wait_for_unhealthy(
    orchestrator: &Orchestrator,
    service: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_until(
        || {
            orchestrator
                .health_monitor()
                .status_of(service)
                .is_some_and(|s| !s.healthy)
        },
        timeout,
    )
    .await
}
