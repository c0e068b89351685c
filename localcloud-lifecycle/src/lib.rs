//! Service lifecycle and resilience core for LocalCloud.
//!
//! Starts and stops the local service fleet in dependency order, health-checks
//! running services, restarts failed ones under a backoff policy and publishes
//! alerts about all of it.

pub mod alerts;
pub mod config;
pub mod deps;
pub mod errors;
pub mod health;
pub mod orchestrator;
pub mod restart;
pub mod runtime;
pub mod state;
pub mod watcher;

pub use alerts::{Alert, AlertBus, AlertKind, AlertReceiver, AlertSeverity};
pub use errors::{LifecycleError, ProbeError, Result, RuntimeError};
pub use health::{HealthCheckSpec, HealthMonitor, HealthStatus};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, ProgressEvent, ServicePhase,
    ServiceRegistration,
};
pub use restart::{RestartDecision, RestartPolicy, RestartPolicyEngine, RestartStatus};
pub use runtime::{ContainerRef, ContainerRuntime, Probe, Provisioner, ServiceStarter};
pub use state::{DesiredState, ServiceStatus};
pub use watcher::{ServiceWatcher, WatchOutcome};
