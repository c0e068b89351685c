//! Exit watching and automatic restarts.
//!
//! Every watched service runs a small state machine in its own task:
//!
//! ```text
//! Idle -> Watching -> Deciding -> Restarting -> Watching ...
//!                        |  ^
//!                        v  |
//!                     BackingOff
//! ```
//!
//! Any phase may end in `Finished`. The transition function is pure; the
//! driver loop performs the side effects each phase asks for and feeds the
//! result back as a [`WatchEvent`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::RuntimeError;
use crate::restart::{DenyReason, RestartDecision, RestartPolicyEngine};
use crate::runtime::{ContainerRef, ContainerRuntime, ServiceStarter};
use crate::state::{ServiceStatus, ServiceTable};

/// Replaces a service's exited container with a new one.
#[async_trait]
pub trait RestartAction: Send + Sync {
    async fn restart(&self, service: &str, old: &ContainerRef) -> Result<ContainerRef, RuntimeError>;
}

/// Stops and removes the old container, then starts a fresh one.
pub struct ReplaceContainer {
    runtime: Arc<dyn ContainerRuntime>,
    starter: Arc<dyn ServiceStarter>,
}

impl ReplaceContainer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, starter: Arc<dyn ServiceStarter>) -> Self {
        Self { runtime, starter }
    }
}

#[async_trait]
impl RestartAction for ReplaceContainer {
    async fn restart(&self, service: &str, old: &ContainerRef) -> Result<ContainerRef, RuntimeError> {
        if let Err(e) = self.runtime.stop(old).await {
            debug!("Stopping old container {} for {} failed: {}", old, service, e);
        }
        if let Err(e) = self.runtime.remove(old).await {
            warn!("Removing old container {} for {} failed: {}", old, service, e);
        }
        self.starter.start().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Started(ContainerRef),
    Exited(i64),
    /// The exit could not be observed.
    WatchLost(String),
    RestartPermitted,
    BackoffRequired(Duration),
    BackoffElapsed,
    RestartDenied(DenyReason),
    RestartSucceeded(ContainerRef),
    RestartFailed { retry_after: Duration },
    StopRequested,
    Cancelled,
}

/// How a watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Cancelled,
    /// The operator is stopping or has stopped the service.
    StoppedByOperator,
    RestartDenied(DenyReason),
    WatchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Watching {
        container: ContainerRef,
    },
    Deciding {
        container: ContainerRef,
        exit_code: i64,
    },
    BackingOff {
        container: ContainerRef,
        exit_code: i64,
        wait: Duration,
    },
    Restarting {
        container: ContainerRef,
        exit_code: i64,
    },
    Finished(WatchOutcome),
}

impl WatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchPhase::Idle => "idle",
            WatchPhase::Watching { .. } => "watching",
            WatchPhase::Deciding { .. } => "deciding",
            WatchPhase::BackingOff { .. } => "backing_off",
            WatchPhase::Restarting { .. } => "restarting",
            WatchPhase::Finished(_) => "finished",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, WatchPhase::Finished(_))
    }

    /// Apply an event. Events that make no sense in the current phase leave it unchanged.
    pub fn on(self, event: WatchEvent) -> WatchPhase {
        use WatchEvent as E;
        use WatchPhase as P;

        match (self, event) {
            (P::Finished(outcome), _) => P::Finished(outcome),
            (_, E::Cancelled) => P::Finished(WatchOutcome::Cancelled),
            (_, E::StopRequested) => P::Finished(WatchOutcome::StoppedByOperator),

            (P::Idle, E::Started(container)) => P::Watching { container },

            (P::Watching { container }, E::Exited(exit_code)) => P::Deciding {
                container,
                exit_code,
            },
            (P::Watching { .. }, E::WatchLost(reason)) => {
                P::Finished(WatchOutcome::WatchFailed(reason))
            }

            (P::Deciding { container, exit_code }, E::RestartPermitted) => P::Restarting {
                container,
                exit_code,
            },
            (P::Deciding { container, exit_code }, E::BackoffRequired(wait)) => P::BackingOff {
                container,
                exit_code,
                wait,
            },
            (P::Deciding { .. }, E::RestartDenied(reason)) => {
                P::Finished(WatchOutcome::RestartDenied(reason))
            }

            (P::BackingOff { container, exit_code, .. }, E::BackoffElapsed) => P::Deciding {
                container,
                exit_code,
            },

            (P::Restarting { .. }, E::RestartSucceeded(container)) => P::Watching { container },
            (P::Restarting { container, exit_code }, E::RestartFailed { retry_after }) => {
                P::BackingOff {
                    container,
                    exit_code,
                    wait: retry_after,
                }
            }

            (phase, event) => {
                debug!("Ignoring watch event {:?} in phase {}", event, phase.as_str());
                phase
            }
        }
    }
}

#[derive(Clone)]
struct WatchContext {
    service: String,
    runtime: Arc<dyn ContainerRuntime>,
    engine: Arc<RestartPolicyEngine>,
    table: Arc<ServiceTable>,
    action: Arc<dyn RestartAction>,
}

impl WatchContext {
    fn operator_allows_restart(&self) -> bool {
        self.table
            .desired_state(&self.service)
            .is_none_or(|state| state.allows_restart())
    }

    fn set_status(&self, status: ServiceStatus) {
        // Services watched outside the table have no descriptor to update
        let _ = self.table.set_status(&self.service, status);
    }
}

struct WatchHandle {
    token: CancellationToken,
    handle: JoinHandle<WatchOutcome>,
}

pub struct ServiceWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    engine: Arc<RestartPolicyEngine>,
    table: Arc<ServiceTable>,
    root: CancellationToken,
    watches: DashMap<String, WatchHandle>,
}

impl ServiceWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        engine: Arc<RestartPolicyEngine>,
        table: Arc<ServiceTable>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            runtime,
            engine,
            table,
            root: parent.child_token(),
            watches: DashMap::new(),
        }
    }

    /// Start watching `container` for `service`, replacing any existing watch.
    pub fn watch(&self, service: &str, container: ContainerRef, action: Arc<dyn RestartAction>) {
        let token = self.root.child_token();
        let ctx = WatchContext {
            service: service.to_string(),
            runtime: self.runtime.clone(),
            engine: self.engine.clone(),
            table: self.table.clone(),
            action,
        };

        let handle = spawn_watch_loop(ctx, container, token.clone());
        if let Some(previous) = self
            .watches
            .insert(service.to_string(), WatchHandle { token, handle })
        {
            previous.token.cancel();
        }
        debug!("Watching {}", service);
    }

    /// Cancel the watch for `service`. A restart already in progress completes.
    pub fn unwatch(&self, service: &str) -> bool {
        match self.watches.remove(service) {
            Some((_, watch)) => {
                watch.token.cancel();
                debug!("Stopped watching {}", service);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, service: &str) -> bool {
        self.watches
            .get(service)
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Wait for the watch on `service` to end and return its outcome.
    pub async fn join(&self, service: &str) -> Option<WatchOutcome> {
        let (_, watch) = self.watches.remove(service)?;
        match watch.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Watch task for {} failed: {}", service, e);
                Some(WatchOutcome::WatchFailed(e.to_string()))
            }
        }
    }

    /// Cancel every watch.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.watches.clear();
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn spawn_watch_loop(
    ctx: WatchContext,
    container: ContainerRef,
    token: CancellationToken,
) -> JoinHandle<WatchOutcome> {
    tokio::spawn(async move { watch_loop(ctx, container, token).await })
}

async fn watch_loop(ctx: WatchContext, container: ContainerRef, token: CancellationToken) -> WatchOutcome {
    let service = ctx.service.as_str();
    let mut phase = WatchPhase::Idle.on(WatchEvent::Started(container));

    loop {
        let event = match &phase {
            WatchPhase::Finished(outcome) => {
                debug!("Watch for {} finished: {:?}", service, outcome);
                return outcome.clone();
            }
            WatchPhase::Idle => WatchEvent::Cancelled,
            WatchPhase::Watching { container } => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => WatchEvent::Cancelled,
                    exit = ctx.runtime.wait_exit(container) => match exit {
                        Ok(code) => {
                            info!("Service {} exited with code {}", service, code);
                            WatchEvent::Exited(code)
                        }
                        Err(e) => {
                            error!("Failed to wait for {} container {}: {}", service, container, e);
                            WatchEvent::WatchLost(e.to_string())
                        }
                    },
                }
            }
            WatchPhase::Deciding { exit_code, .. } => {
                if token.is_cancelled() {
                    WatchEvent::Cancelled
                } else if !ctx.operator_allows_restart() {
                    debug!("Service {} is being stopped, not restarting", service);
                    WatchEvent::StopRequested
                } else {
                    match ctx.engine.should_restart(service, *exit_code) {
                        RestartDecision::Allowed => WatchEvent::RestartPermitted,
                        RestartDecision::Backoff(wait) => WatchEvent::BackoffRequired(wait),
                        RestartDecision::Denied(reason) => {
                            info!("Restart of {} denied: {:?}", service, reason);
                            ctx.set_status(if *exit_code == 0 {
                                ServiceStatus::Stopped
                            } else {
                                ServiceStatus::Failed
                            });
                            WatchEvent::RestartDenied(reason)
                        }
                    }
                }
            }
            WatchPhase::BackingOff { wait, .. } => {
                debug!("Waiting {:?} before restarting {}", wait, service);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => WatchEvent::Cancelled,
                    _ = sleep(*wait) => WatchEvent::BackoffElapsed,
                }
            }
            WatchPhase::Restarting { container, .. } => {
                if !ctx.operator_allows_restart() {
                    WatchEvent::StopRequested
                } else {
                    restart_service(&ctx, container, &token).await
                }
            }
        };

        phase = phase.on(event);
    }
}

/// Run the restart action to completion and report it to the engine.
async fn restart_service(
    ctx: &WatchContext,
    container: &ContainerRef,
    token: &CancellationToken,
) -> WatchEvent {
    let service = ctx.service.as_str();
    info!("Restarting service {}", service);
    ctx.set_status(ServiceStatus::Restarting);

    match ctx.action.restart(service, container).await {
        Ok(new_container) => {
            // Stored before the desired-state check so a concurrent stop
            // either sees the new container or leaves it to us.
            let _ = ctx.table.set_container(service, new_container.clone());
            if !ctx.operator_allows_restart() {
                info!(
                    "Service {} was stopped during restart, discarding {}",
                    service, new_container
                );
                discard_container(ctx, &new_container).await;
                return WatchEvent::StopRequested;
            }
            ctx.engine.record_restart(service, true);
            if ctx.operator_allows_restart() {
                ctx.set_status(ServiceStatus::Running);
            }
            if token.is_cancelled() {
                WatchEvent::Cancelled
            } else {
                WatchEvent::RestartSucceeded(new_container)
            }
        }
        Err(e) => {
            error!("Failed to restart {}: {}", service, e);
            ctx.engine.record_restart(service, false);
            if ctx.operator_allows_restart() {
                ctx.set_status(ServiceStatus::Failed);
            }
            if token.is_cancelled() {
                WatchEvent::Cancelled
            } else {
                WatchEvent::RestartFailed {
                    retry_after: ctx.engine.next_backoff(service),
                }
            }
        }
    }
}

async fn discard_container(ctx: &WatchContext, container: &ContainerRef) {
    if let Err(e) = ctx.runtime.stop(container).await {
        debug!("Stopping discarded container {} for {} failed: {}", container, ctx.service, e);
    }
    if let Err(e) = ctx.runtime.remove(container).await {
        warn!("Removing discarded container {} for {} failed: {}", container, ctx.service, e);
    }
}
