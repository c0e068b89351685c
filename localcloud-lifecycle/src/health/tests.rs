use super::*;
use std::sync::atomic::AtomicU32;

use async_trait::async_trait;

use crate::errors::RuntimeError;
use crate::runtime::{probe_fn, ContainerInspect};

/// Runtime whose inspect/stats answers are set by the test.
#[derive(Default)]
struct FakeRuntime {
    inspect: Mutex<ContainerInspect>,
    stats: Mutex<Option<ResourceSnapshot>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn wait_exit(&self, _container: &ContainerRef) -> Result<i64, RuntimeError> {
        std::future::pending().await
    }

    async fn start(&self, _container: &ContainerRef) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop(&self, _container: &ContainerRef) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, _container: &ContainerRef) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn inspect(&self, _container: &ContainerRef) -> Result<ContainerInspect, RuntimeError> {
        Ok(self.inspect.lock().clone())
    }

    async fn stats(&self, _container: &ContainerRef) -> Result<ResourceSnapshot, RuntimeError> {
        self.stats
            .lock()
            .ok_or_else(|| RuntimeError::Failed("no stats".to_string()))
    }
}

struct FixedDisk(DiskUsage);

impl SystemProbe for FixedDisk {
    fn disk_usage(&self) -> Option<DiskUsage> {
        Some(self.0)
    }
}

fn monitor(runtime: Arc<FakeRuntime>, bus: &AlertBus) -> HealthMonitor {
    HealthMonitor::new(runtime, bus.clone()).with_system_probe(None)
}

fn fail(msg: &str) -> Result<(), ProbeError> {
    Err(ProbeError::Failed(msg.to_string()))
}

fn count(alerts: &[Alert], severity: AlertSeverity) -> usize {
    alerts.iter().filter(|a| a.severity == severity).count()
}

// ============================================================================
// Failure counting
// ============================================================================

#[test]
fn test_threshold_reached_once() {
    let mut status = HealthStatus::default();

    let a1 = apply_check_result("db", &mut status, 3, fail("boom"), Duration::ZERO);
    let a2 = apply_check_result("db", &mut status, 3, fail("boom"), Duration::ZERO);
    assert_eq!(count(&a1, AlertSeverity::Warning), 1);
    assert_eq!(a1[0].message, "Health check failed (1/3): boom");
    assert_eq!(count(&a2, AlertSeverity::Critical), 0);
    assert!(status.healthy);

    let a3 = apply_check_result("db", &mut status, 3, fail("boom"), Duration::ZERO);
    assert_eq!(a3.len(), 1);
    assert_eq!(a3[0].severity, AlertSeverity::Critical);
    assert_eq!(a3[0].kind, AlertKind::RestartRequired);
    assert_eq!(a3[0].message, "Service unhealthy after 3 consecutive failures");
    assert_eq!(a3[0].suggested_action.as_deref(), Some("restart"));
    assert!(!status.healthy);

    let a4 = apply_check_result("db", &mut status, 3, fail("boom"), Duration::ZERO);
    assert!(a4.is_empty());
    assert_eq!(status.consecutive_failures, 4);
}

#[test]
fn test_recovery_alert_once_per_transition() {
    let mut status = HealthStatus::default();
    for _ in 0..2 {
        apply_check_result("db", &mut status, 2, fail("down"), Duration::ZERO);
    }
    assert!(!status.healthy);

    let recovered = apply_check_result("db", &mut status, 2, Ok(()), Duration::from_millis(5));
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].severity, AlertSeverity::Info);
    assert_eq!(recovered[0].message, "Service recovered");
    assert!(status.healthy);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.response_latency, Duration::from_millis(5));

    let again = apply_check_result("db", &mut status, 2, Ok(()), Duration::ZERO);
    assert!(again.is_empty());
}

#[test]
fn test_success_below_threshold_resets_without_recovery_alert() {
    let mut status = HealthStatus::default();
    apply_check_result("db", &mut status, 3, fail("blip"), Duration::ZERO);
    let alerts = apply_check_result("db", &mut status, 3, Ok(()), Duration::ZERO);
    assert!(alerts.is_empty());
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.message, "OK");
}

// ============================================================================
// Resource thresholds
// ============================================================================

#[test]
fn test_resource_alerts() {
    let thresholds = ResourceThresholds::default();
    let snapshot = |cpu, mem| ResourceSnapshot {
        cpu_percent: cpu,
        mem_percent: mem,
        ..Default::default()
    };

    assert!(resource_alerts("ai", &snapshot(10.0, 50.0), &thresholds).is_empty());

    let warn = resource_alerts("ai", &snapshot(10.0, 85.0), &thresholds);
    assert_eq!(warn.len(), 1);
    assert_eq!(warn[0].severity, AlertSeverity::Warning);
    assert_eq!(warn[0].message, "Memory usage warning: 85.0%");

    let crit = resource_alerts("ai", &snapshot(95.5, 92.0), &thresholds);
    assert_eq!(crit.len(), 2);
    assert_eq!(crit[0].severity, AlertSeverity::Critical);
    assert_eq!(crit[0].message, "High memory usage: 92.0%");
    assert_eq!(crit[1].severity, AlertSeverity::Warning);
    assert_eq!(crit[1].message, "High CPU usage: 95.5%");

    // Thresholds are strict
    assert!(resource_alerts("ai", &snapshot(90.0, 80.0), &thresholds).is_empty());
}

#[test]
fn test_disk_alerts() {
    let thresholds = ResourceThresholds::default();
    let usage = |available| DiskUsage {
        total_bytes: 1000,
        available_bytes: available,
    };

    assert!(disk_alerts(&usage(500), &thresholds).is_none());

    let warn = disk_alerts(&usage(150), &thresholds).unwrap();
    assert_eq!(warn.service, SYSTEM_SERVICE);
    assert_eq!(warn.severity, AlertSeverity::Warning);
    assert_eq!(warn.message, "Warning: Disk space low (85.0% used)");

    let crit = disk_alerts(&usage(50), &thresholds).unwrap();
    assert_eq!(crit.severity, AlertSeverity::Critical);
    assert_eq!(crit.message, "Critical: Disk space low (95.0% used)");

    let empty = DiskUsage {
        total_bytes: 0,
        available_bytes: 0,
    };
    assert_eq!(empty.used_percent(), 0.0);
}

// ============================================================================
// Monitor tasks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_monitor_raises_single_critical_at_threshold() {
    let bus = AlertBus::new(100);
    let runtime = Arc::new(FakeRuntime::default());
    let monitor = monitor(runtime, &bus);

    let probe = Arc::new(probe_fn(|_| async { Err(ProbeError::Failed("refused".into())) }));
    monitor.register_service(
        "db",
        ContainerRef::new("db-1"),
        HealthCheckSpec::default()
            .with_probe(probe)
            .with_interval(Duration::from_secs(1))
            .with_failure_threshold(3),
    );

    let token = CancellationToken::new();
    monitor.start(&token);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let first = bus.receiver().drain();
    assert_eq!(count(&first, AlertSeverity::Warning), 2);
    assert_eq!(count(&first, AlertSeverity::Critical), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let rest = bus.receiver().drain();
    assert_eq!(count(&rest, AlertSeverity::Critical), 1);

    let status = monitor.status_of("db").unwrap();
    assert!(!status.healthy);
    assert!(status.consecutive_failures >= 5);
    assert!(status.last_check.is_some());

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_monitor_skips_tick_while_probe_in_flight() {
    let bus = AlertBus::new(100);
    let monitor = monitor(Arc::new(FakeRuntime::default()), &bus);

    let calls = Arc::new(AtomicU32::new(0));
    let probe_calls = calls.clone();
    let probe = Arc::new(probe_fn(move |_| {
        let calls = probe_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(3500)).await;
            Ok(())
        }
    }));

    monitor.register_service(
        "ai",
        ContainerRef::new("ai-1"),
        HealthCheckSpec::default()
            .with_probe(probe)
            .with_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(10)),
    );
    let token = CancellationToken::new();
    monitor.start(&token);

    // Ticks at 1..=5s; the probe started at 1s occupies 1s..4.5s
    tokio::time::sleep(Duration::from_millis(5200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_counts_as_failure() {
    let bus = AlertBus::new(100);
    let monitor = monitor(Arc::new(FakeRuntime::default()), &bus);

    let probe = Arc::new(probe_fn(|_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }));
    monitor.register_service(
        "cache",
        ContainerRef::new("cache-1"),
        HealthCheckSpec::default()
            .with_probe(probe)
            .with_interval(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(2))
            .with_failure_threshold(1),
    );
    let token = CancellationToken::new();
    monitor.start(&token);

    tokio::time::sleep(Duration::from_millis(7500)).await;

    let status = monitor.status_of("cache").unwrap();
    assert!(!status.healthy);
    assert_eq!(status.message, "health check timeout after 2s");
    assert!(status.response_latency >= Duration::from_secs(2));

    let alerts = bus.receiver().drain();
    assert_eq!(count(&alerts, AlertSeverity::Critical), 1);

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_default_probe_uses_inspect() {
    let bus = AlertBus::new(100);
    let runtime = Arc::new(FakeRuntime::default());
    *runtime.inspect.lock() = ContainerInspect {
        running: true,
        health: Some("unhealthy".to_string()),
    };
    *runtime.stats.lock() = Some(ResourceSnapshot {
        cpu_percent: 12.0,
        mem_percent: 40.0,
        mem_usage: 400,
        mem_limit: 1000,
    });
    let monitor = monitor(runtime.clone(), &bus);

    monitor.register_service(
        "database",
        ContainerRef::new("pg"),
        HealthCheckSpec::default()
            .with_interval(Duration::from_secs(1))
            .with_failure_threshold(1),
    );
    let token = CancellationToken::new();
    monitor.start(&token);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = monitor.status_of("database").unwrap();
    assert!(!status.healthy);
    assert_eq!(status.message, "container health status: unhealthy");
    assert_eq!(status.resources.mem_usage, 400);

    runtime.inspect.lock().health = Some("healthy".to_string());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let alerts = bus.receiver().drain();
    let recovered: Vec<_> = alerts
        .iter()
        .filter(|a| a.message == "Service recovered")
        .collect();
    assert_eq!(recovered.len(), 1);
    assert!(monitor.status_of("database").unwrap().healthy);

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_register_after_start_begins_probing() {
    let bus = AlertBus::new(100);
    let monitor = monitor(Arc::new(FakeRuntime::default()), &bus);
    let token = CancellationToken::new();
    monitor.start(&token);
    assert!(monitor.is_started());

    let probe = Arc::new(probe_fn(|_| async { Ok(()) }));
    monitor.register_service(
        "storage",
        ContainerRef::new("minio"),
        HealthCheckSpec::default()
            .with_probe(probe)
            .with_interval(Duration::from_secs(1)),
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = monitor.get_status();
    assert_eq!(status["storage"].message, "OK");

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_zero_interval_and_timeout_fall_back_to_defaults() {
    let bus = AlertBus::new(100);
    let monitor = monitor(Arc::new(FakeRuntime::default()), &bus);

    let calls = Arc::new(AtomicU32::new(0));
    let probe_calls = calls.clone();
    let probe = Arc::new(probe_fn(move |_| {
        let calls = probe_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));
    monitor.register_service(
        "cache",
        ContainerRef::new("redis-1"),
        HealthCheckSpec::default()
            .with_probe(probe)
            .with_interval(Duration::ZERO)
            .with_timeout(Duration::ZERO),
    );
    let token = CancellationToken::new();
    monitor.start(&token);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let status = monitor.status_of("cache").unwrap();
    assert!(status.healthy);
    assert_eq!(status.message, "OK");

    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_unregister_stops_probing() {
    let bus = AlertBus::new(100);
    let monitor = monitor(Arc::new(FakeRuntime::default()), &bus);

    let calls = Arc::new(AtomicU32::new(0));
    let probe_calls = calls.clone();
    let probe = Arc::new(probe_fn(move |_| {
        let calls = probe_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::Failed("nope".into()))
        }
    }));
    monitor.register_service(
        "ai",
        ContainerRef::new("ai-1"),
        HealthCheckSpec::default()
            .with_probe(probe)
            .with_interval(Duration::from_secs(1)),
    );
    let token = CancellationToken::new();
    monitor.start(&token);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(monitor.unregister_service("ai"));
    let seen = calls.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), seen);
    assert!(monitor.status_of("ai").is_none());
    assert!(!monitor.unregister_service("ai"));
}

#[tokio::test]
async fn test_system_check_reports_disk_pressure() {
    let bus = AlertBus::new(100);
    let receiver = bus.receiver();
    let monitor = HealthMonitor::new(Arc::new(FakeRuntime::default()), bus.clone())
        .with_system_probe(Some(Arc::new(FixedDisk(DiskUsage {
            total_bytes: 100,
            available_bytes: 4,
        }))))
        .with_system_interval(Duration::from_millis(20));

    let token = CancellationToken::new();
    monitor.start(&token);

    let alert = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.service, SYSTEM_SERVICE);
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert_eq!(alert.message, "Critical: Disk space low (96.0% used)");

    monitor.stop();
}
