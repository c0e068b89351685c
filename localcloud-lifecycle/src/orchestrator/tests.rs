use super::*;
use parking_lot::Mutex;

use crate::config::RestartMode;
use crate::runtime::{starter_fn, ContainerInspect, ResourceSnapshot};

/// Containers never exit; stops are recorded.
#[derive(Default)]
struct IdleRuntime {
    stopped: Mutex<Vec<ContainerRef>>,
}

#[async_trait]
impl ContainerRuntime for IdleRuntime {
    async fn wait_exit(&self, _container: &ContainerRef) -> Result<i64, RuntimeError> {
        std::future::pending().await
    }

    async fn start(&self, _container: &ContainerRef) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.stopped.lock().push(container.clone());
        Ok(())
    }

    async fn remove(&self, _container: &ContainerRef) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn inspect(&self, _container: &ContainerRef) -> Result<ContainerInspect, RuntimeError> {
        Ok(ContainerInspect {
            running: true,
            health: None,
        })
    }

    async fn stats(&self, _container: &ContainerRef) -> Result<ResourceSnapshot, RuntimeError> {
        Ok(ResourceSnapshot::default())
    }
}

struct FailingProvisioner;

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn provision(&self) -> Result<(), RuntimeError> {
        Err(RuntimeError::Failed("network create failed".to_string()))
    }
}

fn named_starter(id: &'static str) -> Arc<dyn ServiceStarter> {
    Arc::new(starter_fn(move || async move { Ok(ContainerRef::new(id)) }))
}

fn orchestrator(runtime: Arc<IdleRuntime>) -> Orchestrator {
    Orchestrator::builder(runtime)
        .starter("postgres", named_starter("pg-1"))
        .starter("redis", named_starter("redis-1"))
        .starter("ollama", named_starter("ollama-1"))
        .system_probe(None)
        .build()
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<String> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.to_string());
    }
    events
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_unknown_kind_rejected() {
    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    let err = orch
        .register_service(ServiceRegistration::new("search").kind("elastic"))
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Lifecycle(LifecycleError::UnknownServiceKind { .. })
    ));
    assert!(orch.services().is_empty());
}

#[test]
fn test_duplicate_registration_rejected() {
    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    orch.register_service(ServiceRegistration::new("database").kind("postgres"))
        .unwrap();
    let err = orch
        .register_service(ServiceRegistration::new("Database").kind("postgres"))
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Lifecycle(LifecycleError::DuplicateService(_))
    ));
}

#[test]
fn test_resolve_aliases() {
    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    orch.register_service(ServiceRegistration::new("database").kind("postgres"))
        .unwrap();

    assert_eq!(orch.resolve(" PG ").unwrap(), "database");
    assert_eq!(orch.resolve("database").unwrap(), "database");
    assert!(matches!(
        orch.resolve("llm"),
        Err(OrchestratorError::UnknownService(_))
    ));
}

#[test]
fn test_register_from_config() {
    let config = LifecycleConfig::from_yaml(
        r#"
services:
  database:
    kind: postgres
    restart: { policy: on-failure, max_attempts: 3 }
    healthcheck: { interval: 5s }
  ai:
    kind: ollama
    depends_on: [database]
aliases:
  brain: ai
"#,
    )
    .unwrap();

    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    orch.register_from_config(&config).unwrap();

    let names: Vec<_> = orch.services().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["database", "ai"]);
    assert_eq!(orch.resolve("brain").unwrap(), "ai");

    let restart = orch.get_restart_status();
    assert_eq!(restart["database"].mode, RestartMode::OnFailure);
    assert_eq!(restart["database"].max_attempts, 3);
    assert_eq!(restart["ai"].mode, RestartMode::Never);
}

#[test]
fn test_register_from_config_is_all_or_nothing() {
    let config = LifecycleConfig::from_yaml(
        r#"
services:
  database:
    kind: postgres
  search:
    kind: elastic
"#,
    )
    .unwrap();

    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    let err = orch.register_from_config(&config).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Lifecycle(LifecycleError::UnknownServiceKind { ref service, .. })
            if service == "search"
    ));
    assert!(orch.services().is_empty());
    assert!(orch.get_restart_status().is_empty());

    // A clash with an already registered service also leaves the table as it was
    orch.register_service(ServiceRegistration::new("ai").kind("ollama"))
        .unwrap();
    let config = LifecycleConfig::from_yaml(
        "services:\n  database:\n    kind: postgres\n  ai:\n    kind: ollama\n",
    )
    .unwrap();
    let err = orch.register_from_config(&config).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Lifecycle(LifecycleError::DuplicateService(_))
    ));
    let names: Vec<_> = orch.services().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["ai"]);
}

#[test]
fn test_unregister_removes_everywhere() {
    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    orch.register_service(ServiceRegistration::new("cache").kind("redis"))
        .unwrap();

    orch.unregister_service("redis").unwrap();
    assert!(orch.service("cache").is_none());
    assert!(orch.get_restart_status().is_empty());
    assert!(matches!(
        orch.unregister_service("cache"),
        Err(OrchestratorError::UnknownService(_))
    ));
}

// ============================================================================
// Start / stop
// ============================================================================

#[tokio::test]
async fn test_start_and_stop_all_emit_progress_in_order() {
    let runtime = Arc::new(IdleRuntime::default());
    let orch = orchestrator(runtime.clone());
    orch.register_service(
        ServiceRegistration::new("ai")
            .kind("ollama")
            .depends_on(&["database"]),
    )
    .unwrap();
    orch.register_service(ServiceRegistration::new("database").kind("postgres"))
        .unwrap();

    let (tx, mut rx) = progress_channel();
    orch.start_all(Some(tx)).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            "database: starting",
            "database: started",
            "ai: starting",
            "ai: started"
        ]
    );

    let db = orch.service("database").unwrap();
    assert_eq!(db.status, ServiceStatus::Running);
    assert_eq!(db.desired_state, DesiredState::Running);
    assert_eq!(db.container, Some(ContainerRef::new("pg-1")));
    assert!(orch.watcher().is_watching("database"));

    let (tx, mut rx) = progress_channel();
    orch.stop_all(Some(tx)).await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            "ai: stopping",
            "ai: stopped",
            "database: stopping",
            "database: stopped"
        ]
    );
    assert_eq!(
        *runtime.stopped.lock(),
        vec![ContainerRef::new("ollama-1"), ContainerRef::new("pg-1")]
    );
    assert_eq!(
        orch.service("ai").unwrap().desired_state,
        DesiredState::Stopped
    );

    orch.shutdown();
}

#[tokio::test]
async fn test_start_all_twice_is_noop() {
    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    orch.register_service(ServiceRegistration::new("database").kind("postgres"))
        .unwrap();

    orch.start_all(None).await.unwrap();
    let (tx, mut rx) = progress_channel();
    orch.start_all(Some(tx)).await.unwrap();
    assert!(drain(&mut rx).is_empty());

    orch.shutdown();
}

#[tokio::test]
async fn test_provisioning_failure_aborts_before_any_start() {
    let orch = Orchestrator::builder(Arc::new(IdleRuntime::default()))
        .starter("postgres", named_starter("pg-1"))
        .provisioner(Arc::new(FailingProvisioner))
        .system_probe(None)
        .build();
    orch.register_service(ServiceRegistration::new("database").kind("postgres"))
        .unwrap();

    let (tx, mut rx) = progress_channel();
    let err = orch.start_all(Some(tx)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Provisioning(_)));
    assert!(drain(&mut rx).is_empty());
    assert_eq!(
        orch.service("database").unwrap().status,
        ServiceStatus::Stopped
    );
    assert!(!orch.health_monitor().is_started());
}

#[tokio::test]
async fn test_stop_never_started_service_is_quiet() {
    let orch = orchestrator(Arc::new(IdleRuntime::default()));
    orch.register_service(ServiceRegistration::new("cache").kind("redis"))
        .unwrap();

    let (tx, mut rx) = progress_channel();
    orch.stop_all(Some(tx)).await.unwrap();
    assert!(drain(&mut rx).is_empty());
}
