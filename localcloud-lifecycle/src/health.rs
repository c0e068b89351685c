//! Periodic health checking.
//!
//! Each registered service gets its own probing task. A tick is skipped while
//! the previous probe for that service is still running. Consecutive failures
//! are counted; crossing the threshold marks the service unhealthy and raises
//! a `RestartRequired` alert. Resource usage is sampled on every tick and a
//! separate task watches system-wide disk usage.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::Disks;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertBus, AlertKind, AlertSeverity};
use crate::config::{HealthCheckConfig, ResourceThresholds};
use crate::errors::ProbeError;
use crate::runtime::{ContainerRef, ContainerRuntime, InspectProbe, Probe, ResourceSnapshot};

/// Service name used for system-wide alerts.
pub const SYSTEM_SERVICE: &str = "system";

/// Probe settings for one service.
#[derive(Clone)]
pub struct HealthCheckSpec {
    /// `None` uses the container inspection probe.
    pub probe: Option<Arc<dyn Probe>>,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self::from(&HealthCheckConfig::default())
    }
}

impl fmt::Debug for HealthCheckSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckSpec")
            .field("custom_probe", &self.probe.is_some())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}

impl From<&HealthCheckConfig> for HealthCheckSpec {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            probe: None,
            interval: config.interval,
            timeout: config.timeout,
            failure_threshold: config.failure_threshold,
        }
    }
}

impl HealthCheckSpec {
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub last_check: Option<DateTime<Utc>>,
    pub response_latency: Duration,
    pub resources: ResourceSnapshot,
    pub consecutive_failures: u32,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            message: "Not checked yet".to_string(),
            last_check: None,
            response_latency: Duration::ZERO,
            resources: ResourceSnapshot::default(),
            consecutive_failures: 0,
        }
    }
}

/// Fold one probe result into `status`, returning the alerts it produces.
pub fn apply_check_result(
    service: &str,
    status: &mut HealthStatus,
    threshold: u32,
    result: Result<(), ProbeError>,
    latency: Duration,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    status.last_check = Some(Utc::now());
    status.response_latency = latency;

    match result {
        Ok(()) => {
            if !status.healthy {
                info!("Service {} recovered", service);
                alerts.push(Alert::new(
                    service,
                    AlertKind::HealthCheck,
                    AlertSeverity::Info,
                    "Service recovered",
                ));
            }
            status.healthy = true;
            status.consecutive_failures = 0;
            status.message = "OK".to_string();
        }
        Err(e) => {
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            let failures = status.consecutive_failures;
            status.message = e.to_string();

            if failures < threshold {
                warn!(
                    "Health check failed for {} ({}/{}): {}",
                    service, failures, threshold, e
                );
                alerts.push(Alert::new(
                    service,
                    AlertKind::HealthCheck,
                    AlertSeverity::Warning,
                    format!("Health check failed ({}/{}): {}", failures, threshold, e),
                ));
            } else if failures == threshold {
                status.healthy = false;
                info!(
                    "Service {} marked as unhealthy after {} failures",
                    service, failures
                );
                alerts.push(
                    Alert::new(
                        service,
                        AlertKind::RestartRequired,
                        AlertSeverity::Critical,
                        format!(
                            "Service unhealthy after {} consecutive failures",
                            failures
                        ),
                    )
                    .with_action("restart"),
                );
            } else {
                debug!(
                    "Health check still failing for {} ({} consecutive): {}",
                    service, failures, e
                );
            }
        }
    }

    alerts
}

/// Alerts for a container's CPU and memory usage.
pub fn resource_alerts(
    service: &str,
    snapshot: &ResourceSnapshot,
    thresholds: &ResourceThresholds,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if snapshot.mem_percent > thresholds.memory_critical {
        alerts.push(
            Alert::new(
                service,
                AlertKind::ResourceLimit,
                AlertSeverity::Critical,
                format!("High memory usage: {:.1}%", snapshot.mem_percent),
            )
            .with_action("increase memory limit or reduce load"),
        );
    } else if snapshot.mem_percent > thresholds.memory_warning {
        alerts.push(Alert::new(
            service,
            AlertKind::ResourceLimit,
            AlertSeverity::Warning,
            format!("Memory usage warning: {:.1}%", snapshot.mem_percent),
        ));
    }

    if snapshot.cpu_percent > thresholds.cpu_warning {
        alerts.push(Alert::new(
            service,
            AlertKind::ResourceLimit,
            AlertSeverity::Warning,
            format!("High CPU usage: {:.1}%", snapshot.cpu_percent),
        ));
    }

    alerts
}

// ============================================================================
// System-wide checks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Source of host-level resource readings.
pub trait SystemProbe: Send + Sync {
    fn disk_usage(&self) -> Option<DiskUsage>;
}

/// Disk usage of the filesystem holding `path`, read through `sysinfo`.
#[derive(Debug, Clone)]
pub struct SysinfoProbe {
    path: PathBuf,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SysinfoProbe {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SystemProbe for SysinfoProbe {
    fn disk_usage(&self) -> Option<DiskUsage> {
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins
        disks
            .list()
            .iter()
            .filter(|d| self.path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| DiskUsage {
                total_bytes: d.total_space(),
                available_bytes: d.available_space(),
            })
    }
}

pub fn disk_alerts(usage: &DiskUsage, thresholds: &ResourceThresholds) -> Option<Alert> {
    let percent = usage.used_percent();
    if percent > thresholds.disk_critical {
        Some(
            Alert::new(
                SYSTEM_SERVICE,
                AlertKind::ResourceLimit,
                AlertSeverity::Critical,
                format!("Critical: Disk space low ({:.1}% used)", percent),
            )
            .with_action("free disk space"),
        )
    } else if percent > thresholds.disk_warning {
        Some(Alert::new(
            SYSTEM_SERVICE,
            AlertKind::ResourceLimit,
            AlertSeverity::Warning,
            format!("Warning: Disk space low ({:.1}% used)", percent),
        ))
    } else {
        None
    }
}

// ============================================================================
// Monitor
// ============================================================================

struct MonitorEntry {
    service: String,
    container: Mutex<ContainerRef>,
    probe: Arc<dyn Probe>,
    interval: Duration,
    timeout: Duration,
    threshold: u32,
    status: Mutex<HealthStatus>,
    in_flight: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl MonitorEntry {
    fn cancel(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }
}

/// Clears the in-flight flag when the probe task ends, even by panic.
struct InFlightGuard(Arc<MonitorEntry>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct CheckContext {
    runtime: Arc<dyn ContainerRuntime>,
    alerts: AlertBus,
    thresholds: ResourceThresholds,
}

pub struct HealthMonitor {
    ctx: CheckContext,
    system_probe: Option<Arc<dyn SystemProbe>>,
    system_interval: Duration,
    entries: DashMap<String, Arc<MonitorEntry>>,
    root: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, alerts: AlertBus) -> Self {
        Self {
            ctx: CheckContext {
                runtime,
                alerts,
                thresholds: ResourceThresholds::default(),
            },
            system_probe: Some(Arc::new(SysinfoProbe::default())),
            system_interval: Duration::from_secs(60),
            entries: DashMap::new(),
            root: Mutex::new(None),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ResourceThresholds) -> Self {
        self.ctx.thresholds = thresholds;
        self
    }

    /// Replace (or with `None`, disable) the system-wide resource probe.
    pub fn with_system_probe(mut self, probe: Option<Arc<dyn SystemProbe>>) -> Self {
        self.system_probe = probe;
        self
    }

    pub fn with_system_interval(mut self, interval: Duration) -> Self {
        self.system_interval = interval;
        self
    }

    /// Register a service for monitoring. Replaces any existing registration.
    ///
    /// If the monitor is already started, probing begins immediately.
    pub fn register_service(&self, service: &str, container: ContainerRef, spec: HealthCheckSpec) {
        let probe: Arc<dyn Probe> = match spec.probe {
            Some(probe) => probe,
            None => Arc::new(InspectProbe::new(self.ctx.runtime.clone())),
        };

        let defaults = HealthCheckConfig::default();
        let interval = if spec.interval.is_zero() {
            warn!("Zero health check interval for {}, using {:?}", service, defaults.interval);
            defaults.interval
        } else {
            spec.interval
        };
        let probe_timeout = if spec.timeout.is_zero() {
            warn!("Zero health check timeout for {}, using {:?}", service, defaults.timeout);
            defaults.timeout
        } else {
            spec.timeout
        };

        let entry = Arc::new(MonitorEntry {
            service: service.to_string(),
            container: Mutex::new(container),
            probe,
            interval,
            timeout: probe_timeout,
            threshold: spec.failure_threshold.max(1),
            status: Mutex::new(HealthStatus::default()),
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(None),
        });

        if let Some(previous) = self.entries.insert(service.to_string(), entry.clone()) {
            previous.cancel();
        }

        let root = self.root.lock().clone();
        if let Some(root) = root {
            self.spawn_checker(entry, &root);
        }

        debug!("Registered health monitor for {}", service);
    }

    /// Stop probing `service` and forget its status.
    pub fn unregister_service(&self, service: &str) -> bool {
        match self.entries.remove(service) {
            Some((_, entry)) => {
                entry.cancel();
                debug!("Unregistered health monitor for {}", service);
                true
            }
            None => false,
        }
    }

    /// Point the probe at a replacement container.
    pub fn update_container(&self, service: &str, container: ContainerRef) -> bool {
        match self.entries.get(service) {
            Some(entry) => {
                *entry.container.lock() = container;
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, service: &str) -> bool {
        self.entries.contains_key(service)
    }

    pub fn is_started(&self) -> bool {
        self.root.lock().is_some()
    }

    /// Launch probing tasks for all registered services plus the system task.
    ///
    /// Calling this again while started does nothing.
    pub fn start(&self, token: &CancellationToken) {
        let root = {
            let mut guard = self.root.lock();
            if guard.is_some() {
                return;
            }
            let root = token.child_token();
            *guard = Some(root.clone());
            root
        };

        let entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            self.spawn_checker(entry, &root);
        }

        if let Some(probe) = &self.system_probe {
            spawn_system_checker(
                probe.clone(),
                self.system_interval,
                self.ctx.clone(),
                root.child_token(),
            );
        }

        info!("Health monitor started for {} services", self.entries.len());
    }

    /// Cancel every probing task. Registrations are kept.
    pub fn stop(&self) {
        if let Some(root) = self.root.lock().take() {
            root.cancel();
        }
        for entry in self.entries.iter() {
            entry.cancel();
        }
    }

    pub fn get_status(&self) -> HashMap<String, HealthStatus> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.status.lock().clone()))
            .collect()
    }

    pub fn status_of(&self, service: &str) -> Option<HealthStatus> {
        self.entries.get(service).map(|e| e.status.lock().clone())
    }

    fn spawn_checker(&self, entry: Arc<MonitorEntry>, root: &CancellationToken) {
        let token = root.child_token();
        {
            let mut slot = entry.cancel.lock();
            if let Some(old) = slot.replace(token.clone()) {
                old.cancel();
            }
        }
        spawn_health_checker(entry, self.ctx.clone(), token);
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_health_checker(
    entry: Arc<MonitorEntry>,
    ctx: CheckContext,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        health_check_loop(entry, ctx, token).await;
    })
}

async fn health_check_loop(entry: Arc<MonitorEntry>, ctx: CheckContext, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + entry.interval, entry.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Health check for {} stopping - cancelled", entry.service);
                return;
            }
            _ = ticker.tick() => {}
        }

        if entry.in_flight.swap(true, Ordering::AcqRel) {
            debug!(
                "Health check for {} still in flight, skipping tick",
                entry.service
            );
            continue;
        }

        let guard = InFlightGuard(entry.clone());
        let ctx = ctx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            run_health_check(&guard.0, &ctx, &token).await;
            drop(guard);
        });
    }
}

async fn run_health_check(entry: &MonitorEntry, ctx: &CheckContext, token: &CancellationToken) {
    let container = entry.container.lock().clone();

    let started = Instant::now();
    let result = match timeout(entry.timeout, entry.probe.check(&container)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(entry.timeout)),
    };
    let latency = started.elapsed();

    let resources = match ctx.runtime.stats(&container).await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            debug!("Failed to read stats for {}: {}", entry.service, e);
            None
        }
    };

    // Unregistered while probing
    if token.is_cancelled() {
        return;
    }

    let alerts = {
        let mut status = entry.status.lock();
        let mut alerts =
            apply_check_result(&entry.service, &mut status, entry.threshold, result, latency);
        if let Some(snapshot) = &resources {
            status.resources = *snapshot;
            alerts.extend(resource_alerts(&entry.service, snapshot, &ctx.thresholds));
        }
        alerts
    };

    for alert in alerts {
        ctx.alerts.send(alert);
    }
}

fn spawn_system_checker(
    probe: Arc<dyn SystemProbe>,
    period: Duration,
    ctx: CheckContext,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let probe = probe.clone();
            let usage = match tokio::task::spawn_blocking(move || probe.disk_usage()).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!("System resource check failed: {}", e);
                    None
                }
            };

            match usage {
                Some(usage) => {
                    if let Some(alert) = disk_alerts(&usage, &ctx.thresholds) {
                        ctx.alerts.send(alert);
                    }
                }
                None => debug!("Disk usage unavailable"),
            }
        }
    })
}

#[cfg(test)]
mod tests;
