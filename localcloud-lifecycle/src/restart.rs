//! Restart policy engine.
//!
//! Decides whether a service that exited may be restarted and how long it has
//! to wait first. State is kept per service behind its own mutex, so decisions
//! for one service are serialized while other services proceed in parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertBus, AlertKind, AlertSeverity};
use crate::config::{default_backoff, RestartConfig, RestartMode};

/// Hook fired after each successful restart with `(service, attempt)`.
pub type RestartHook = Arc<dyn Fn(String, u32) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    /// 0 means unlimited.
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub on_restart: Option<RestartHook>,
}

impl fmt::Debug for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestartPolicy")
            .field("mode", &self.mode)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("on_restart", &self.on_restart.is_some())
            .finish()
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(RestartMode::Never)
    }
}

impl RestartPolicy {
    pub fn new(mode: RestartMode) -> Self {
        Self {
            mode,
            max_attempts: 0,
            backoff: default_backoff(),
            on_restart: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(String, u32) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.on_restart = Some(Arc::new(hook));
        self
    }

    /// Wait required before the restart following `attempts` prior restarts.
    ///
    /// The schedule is clamped at its last entry.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let idx = (attempts as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or_default()
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        RestartPolicy::new(config.mode())
            .with_max_attempts(config.max_attempts())
            .with_backoff(config.backoff())
    }
}

/// Why a restart was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotRegistered,
    PolicyNever,
    CleanExit,
    MaxAttemptsReached,
}

/// Outcome of [`RestartPolicyEngine::should_restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Allowed,
    /// Not yet; eligible again after the given wait.
    Backoff(Duration),
    Denied(DenyReason),
}

impl RestartDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RestartDecision::Allowed)
    }

    pub fn wait_remaining(&self) -> Duration {
        match self {
            RestartDecision::Backoff(wait) => *wait,
            _ => Duration::ZERO,
        }
    }

    /// `(allowed, wait_remaining)` pair.
    pub fn as_tuple(&self) -> (bool, Duration) {
        (self.allowed(), self.wait_remaining())
    }
}

/// Restart bookkeeping exposed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartStatus {
    pub mode: RestartMode,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub next_backoff: Duration,
}

struct PolicyEntry {
    policy: RestartPolicy,
    attempts: u32,
    last_restart: Option<Instant>,
    last_restart_at: Option<DateTime<Utc>>,
    exhaustion_reported: bool,
}

impl PolicyEntry {
    fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_restart: None,
            last_restart_at: None,
            exhaustion_reported: false,
        }
    }

    fn status(&self) -> RestartStatus {
        RestartStatus {
            mode: self.policy.mode,
            attempts: self.attempts,
            max_attempts: self.policy.max_attempts,
            last_restart: self.last_restart_at,
            next_backoff: self.policy.backoff_for(self.attempts),
        }
    }
}

pub struct RestartPolicyEngine {
    entries: DashMap<String, Arc<Mutex<PolicyEntry>>>,
    alerts: AlertBus,
}

impl RestartPolicyEngine {
    pub fn new(alerts: AlertBus) -> Self {
        Self {
            entries: DashMap::new(),
            alerts,
        }
    }

    /// Install (or replace) the policy for a service and reset its attempts.
    ///
    /// An empty backoff schedule is replaced with the default one.
    pub fn register_policy(&self, service: &str, mut policy: RestartPolicy) {
        if policy.backoff.is_empty() {
            policy.backoff = default_backoff();
        }
        debug!(
            "Registered restart policy for {}: {} (max attempts {})",
            service, policy.mode, policy.max_attempts
        );
        self.entries
            .insert(service.to_string(), Arc::new(Mutex::new(PolicyEntry::new(policy))));
    }

    pub fn unregister(&self, service: &str) -> bool {
        self.entries.remove(service).is_some()
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.entries.contains_key(service)
    }

    pub fn policy(&self, service: &str) -> Option<RestartPolicy> {
        self.entry(service).map(|e| e.lock().policy.clone())
    }

    fn entry(&self, service: &str) -> Option<Arc<Mutex<PolicyEntry>>> {
        self.entries.get(service).map(|e| e.value().clone())
    }

    /// Decide whether `service` may be restarted after exiting with `exit_code`.
    pub fn should_restart(&self, service: &str, exit_code: i64) -> RestartDecision {
        let Some(entry) = self.entry(service) else {
            return RestartDecision::Denied(DenyReason::NotRegistered);
        };
        let mut state = entry.lock();

        match state.policy.mode {
            RestartMode::Never => return RestartDecision::Denied(DenyReason::PolicyNever),
            RestartMode::OnFailure if exit_code == 0 => {
                return RestartDecision::Denied(DenyReason::CleanExit);
            }
            RestartMode::Always | RestartMode::OnFailure | RestartMode::UnlessStopped => {}
        }

        let max_attempts = state.policy.max_attempts;
        if max_attempts > 0 && state.attempts >= max_attempts {
            if !state.exhaustion_reported {
                state.exhaustion_reported = true;
                self.alerts.send(
                    Alert::new(
                        service,
                        AlertKind::RecoveryFailed,
                        AlertSeverity::Critical,
                        format!("Max restart attempts ({}) reached", max_attempts),
                    )
                    .with_action("investigate"),
                );
            }
            return RestartDecision::Denied(DenyReason::MaxAttemptsReached);
        }

        let backoff = state.policy.backoff_for(state.attempts);
        if let Some(last) = state.last_restart {
            let elapsed = last.elapsed();
            if elapsed < backoff {
                let wait = backoff - elapsed;
                debug!(
                    "Restart of {} deferred by backoff, {:?} remaining",
                    service, wait
                );
                return RestartDecision::Backoff(wait);
            }
        }

        RestartDecision::Allowed
    }

    /// Record the outcome of a restart action.
    ///
    /// Only successful restarts count toward the attempt limit.
    pub fn record_restart(&self, service: &str, success: bool) {
        let Some(entry) = self.entry(service) else {
            warn!("Restart recorded for unregistered service {}", service);
            return;
        };

        if !success {
            self.alerts.emit(
                service,
                AlertKind::RecoveryFailed,
                AlertSeverity::Warning,
                "Restart failed",
            );
            return;
        }

        let (attempt, hook) = {
            let mut state = entry.lock();
            state.attempts += 1;
            state.last_restart = Some(Instant::now());
            state.last_restart_at = Some(Utc::now());
            (state.attempts, state.policy.on_restart.clone())
        };

        info!("Service {} restarted (attempt {})", service, attempt);

        if let Some(hook) = hook {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(hook(service.to_string(), attempt));
                }
                Err(_) => warn!(
                    "No async runtime available, skipping restart hook for {}",
                    service
                ),
            }
        }

        self.alerts.emit(
            service,
            AlertKind::Restarted,
            AlertSeverity::Info,
            format!("Service restarted (attempt {})", attempt),
        );
    }

    pub fn reset_attempts(&self, service: &str) {
        if let Some(entry) = self.entry(service) {
            let mut state = entry.lock();
            state.attempts = 0;
            state.last_restart = None;
            state.last_restart_at = None;
            state.exhaustion_reported = false;
            debug!("Reset restart attempts for {}", service);
        }
    }

    /// Backoff that applies to the next restart of `service`.
    pub fn next_backoff(&self, service: &str) -> Duration {
        self.entry(service)
            .map(|e| {
                let state = e.lock();
                state.policy.backoff_for(state.attempts)
            })
            .unwrap_or_default()
    }

    pub fn attempts(&self, service: &str) -> Option<u32> {
        self.entry(service).map(|e| e.lock().attempts)
    }

    pub fn status_of(&self, service: &str) -> Option<RestartStatus> {
        self.entry(service).map(|e| e.lock().status())
    }

    pub fn status(&self) -> HashMap<String, RestartStatus> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().status()))
            .collect()
    }
}
