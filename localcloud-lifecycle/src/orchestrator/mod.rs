//! Service orchestration.
//!
//! The [`Orchestrator`] owns the service table and wires the other components
//! together: it starts services in dependency order through their registered
//! starters, hands each started container to the health monitor and the exit
//! watcher, and stops everything in reverse order.

mod error;
mod progress;
mod registry;

pub use error::OrchestratorError;
pub use progress::{progress_channel, ProgressEvent, ProgressSender, ServicePhase, PROGRESS_CHANNEL_CAPACITY};
pub use registry::{normalize_name, AliasTable, StarterRegistry};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertBus, AlertReceiver};
use crate::config::{LifecycleConfig, ResourceThresholds, DEFAULT_ALERT_CAPACITY};
use crate::deps::{get_start_order, get_stop_order, with_dependencies};
use crate::errors::{LifecycleError, RuntimeError};
use crate::health::{HealthCheckSpec, HealthMonitor, HealthStatus, SystemProbe, SysinfoProbe};
use crate::restart::{RestartPolicy, RestartPolicyEngine, RestartStatus};
use crate::runtime::{ContainerRef, ContainerRuntime, Provisioner, ServiceStarter};
use crate::state::{DesiredState, ServiceDescriptor, ServiceStatus, ServiceTable};
use crate::watcher::{ReplaceContainer, RestartAction, ServiceWatcher};
use progress::emit;

/// Everything needed to register one service.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub name: String,
    /// Starter kind; defaults to the service name.
    pub kind: String,
    pub depends_on: Vec<String>,
    pub restart: RestartPolicy,
    pub healthcheck: Option<HealthCheckSpec>,
}

impl ServiceRegistration {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: name.to_string(),
            depends_on: Vec::new(),
            restart: RestartPolicy::default(),
            healthcheck: None,
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn healthcheck(mut self, spec: HealthCheckSpec) -> Self {
        self.healthcheck = Some(spec);
        self
    }
}

struct RegisteredService {
    starter: Arc<dyn ServiceStarter>,
    healthcheck: Option<HealthCheckSpec>,
}

/// Restart action used for orchestrated services: replaces the container and
/// points the health monitor at the new one.
struct OrchestratedRestart {
    replace: ReplaceContainer,
    health: Arc<HealthMonitor>,
}

#[async_trait]
impl RestartAction for OrchestratedRestart {
    async fn restart(&self, service: &str, old: &ContainerRef) -> Result<ContainerRef, RuntimeError> {
        let container = self.replace.restart(service, old).await?;
        self.health.update_container(service, container.clone());
        Ok(container)
    }
}

pub struct OrchestratorBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    starters: StarterRegistry,
    aliases: AliasTable,
    provisioner: Option<Arc<dyn Provisioner>>,
    alert_capacity: usize,
    thresholds: ResourceThresholds,
    system_probe: Option<Arc<dyn SystemProbe>>,
    system_check_interval: Duration,
}

impl OrchestratorBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            starters: StarterRegistry::new(),
            aliases: AliasTable::with_defaults(),
            provisioner: None,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            thresholds: ResourceThresholds::default(),
            system_probe: Some(Arc::new(SysinfoProbe::default())),
            system_check_interval: Duration::from_secs(60),
        }
    }

    pub fn starter(mut self, kind: &str, starter: Arc<dyn ServiceStarter>) -> Self {
        self.starters.register(kind, starter);
        self
    }

    pub fn starters(mut self, starters: StarterRegistry) -> Self {
        self.starters = starters;
        self
    }

    pub fn alias(mut self, alias: &str, canonical: &str) -> Self {
        self.aliases.insert(alias, canonical);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn alert_capacity(mut self, capacity: usize) -> Self {
        self.alert_capacity = capacity;
        self
    }

    pub fn thresholds(mut self, thresholds: ResourceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// `None` disables the system-wide disk check.
    pub fn system_probe(mut self, probe: Option<Arc<dyn SystemProbe>>) -> Self {
        self.system_probe = probe;
        self
    }

    pub fn system_check_interval(mut self, interval: Duration) -> Self {
        self.system_check_interval = interval;
        self
    }

    /// Apply the global settings of a configuration document.
    ///
    /// Services are registered separately with [`Orchestrator::register_from_config`].
    pub fn config(mut self, config: &LifecycleConfig) -> Self {
        self.alert_capacity = config.alert_capacity;
        self.thresholds = config.thresholds;
        self.system_check_interval = config.system_check_interval;
        for (alias, canonical) in &config.aliases {
            self.aliases.insert(alias, canonical);
        }
        self
    }

    pub fn build(self) -> Orchestrator {
        let token = CancellationToken::new();
        let alerts = AlertBus::new(self.alert_capacity);
        let table = Arc::new(ServiceTable::new());
        let engine = Arc::new(RestartPolicyEngine::new(alerts.clone()));
        let health = Arc::new(
            HealthMonitor::new(self.runtime.clone(), alerts.clone())
                .with_thresholds(self.thresholds)
                .with_system_probe(self.system_probe)
                .with_system_interval(self.system_check_interval),
        );
        let watcher = Arc::new(ServiceWatcher::new(
            self.runtime.clone(),
            engine.clone(),
            table.clone(),
            &token,
        ));

        Orchestrator {
            runtime: self.runtime,
            table,
            starters: self.starters,
            aliases: RwLock::new(self.aliases),
            services: DashMap::new(),
            engine,
            health,
            watcher,
            provisioner: self.provisioner,
            alerts,
            token,
        }
    }
}

/// Dependency-aware starter and stopper for the service fleet.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    table: Arc<ServiceTable>,
    starters: StarterRegistry,
    aliases: RwLock<AliasTable>,
    services: DashMap<String, RegisteredService>,
    engine: Arc<RestartPolicyEngine>,
    health: Arc<HealthMonitor>,
    watcher: Arc<ServiceWatcher>,
    provisioner: Option<Arc<dyn Provisioner>>,
    alerts: AlertBus,
    token: CancellationToken,
}

impl Orchestrator {
    pub fn builder(runtime: Arc<dyn ContainerRuntime>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(runtime)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a service. Its starter is resolved from its kind right away.
    pub fn register_service(&self, registration: ServiceRegistration) -> Result<(), OrchestratorError> {
        let name = normalize_name(&registration.name);
        let starter = self.starters.get(&registration.kind).ok_or_else(|| {
            LifecycleError::UnknownServiceKind {
                service: name.clone(),
                kind: registration.kind.clone(),
            }
        })?;

        let depends_on = registration
            .depends_on
            .iter()
            .map(|d| normalize_name(d))
            .collect();
        self.table.insert(ServiceDescriptor::new(
            name.clone(),
            normalize_name(&registration.kind),
            depends_on,
        ))?;

        self.engine.register_policy(&name, registration.restart);
        self.services.insert(
            name.clone(),
            RegisteredService {
                starter,
                healthcheck: registration.healthcheck,
            },
        );

        debug!("Registered service {} (kind {})", name, registration.kind);
        Ok(())
    }

    /// Register every service of a configuration document, in document order.
    ///
    /// Nothing is registered unless every service can be.
    pub fn register_from_config(&self, config: &LifecycleConfig) -> Result<(), OrchestratorError> {
        config.validate()?;

        let mut registrations = Vec::with_capacity(config.services.len());
        for service in &config.services {
            let mut registration = ServiceRegistration::new(&service.name)
                .kind(service.config.kind_or(&service.name))
                .restart(RestartPolicy::from(&service.config.restart));
            registration.depends_on = service.config.depends_on.clone();
            if let Some(hc) = &service.config.healthcheck {
                registration = registration.healthcheck(HealthCheckSpec::from(hc));
            }
            registrations.push(registration);
        }

        let mut names = HashSet::new();
        for registration in &registrations {
            let name = normalize_name(&registration.name);
            if !self.starters.contains(&registration.kind) {
                return Err(LifecycleError::UnknownServiceKind {
                    service: name,
                    kind: registration.kind.clone(),
                }
                .into());
            }
            if self.table.contains(&name) || !names.insert(name.clone()) {
                return Err(LifecycleError::DuplicateService(name).into());
            }
        }

        for registration in registrations {
            self.register_service(registration)?;
        }

        let mut aliases = self.aliases.write();
        for (alias, canonical) in &config.aliases {
            aliases.insert(alias, canonical);
        }
        Ok(())
    }

    /// Forget a service entirely, cancelling its watcher and health checks.
    ///
    /// The container itself is left alone.
    pub fn unregister_service(&self, name: &str) -> Result<(), OrchestratorError> {
        let name = self.resolve(name)?;
        self.watcher.unwatch(&name);
        self.health.unregister_service(&name);
        self.engine.unregister(&name);
        self.services.remove(&name);
        self.table.remove(&name);
        debug!("Unregistered service {}", name);
        Ok(())
    }

    /// Resolve a user-supplied name or alias to a registered service name.
    pub fn resolve(&self, input: &str) -> Result<String, OrchestratorError> {
        let name = self.aliases.read().resolve(input);
        if self.table.contains(&name) {
            Ok(name)
        } else {
            Err(OrchestratorError::UnknownService(input.to_string()))
        }
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    /// Start every registered service in dependency order.
    ///
    /// A failing service does not stop the others from being attempted; the
    /// last failure is returned.
    pub async fn start_all(&self, progress: Option<ProgressSender>) -> Result<(), OrchestratorError> {
        self.start_services(None, &progress).await
    }

    /// Start the named services (names or aliases) plus their dependencies.
    pub async fn start_selected(
        &self,
        names: &[&str],
        progress: Option<ProgressSender>,
    ) -> Result<(), OrchestratorError> {
        let resolved = names
            .iter()
            .map(|n| self.resolve(n))
            .collect::<Result<Vec<_>, _>>()?;
        let targets = with_dependencies(&self.table.snapshot(), &resolved)?;
        self.start_services(Some(targets), &progress).await
    }

    async fn start_services(
        &self,
        filter: Option<HashSet<String>>,
        progress: &Option<ProgressSender>,
    ) -> Result<(), OrchestratorError> {
        let order = get_start_order(&self.table.snapshot())?;

        self.provision().await?;
        self.health.start(&self.token);

        let mut last_error = None;
        for name in order {
            if filter.as_ref().is_some_and(|f| !f.contains(&name)) {
                continue;
            }
            if let Err(e) = self.start_service(&name, progress).await {
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn provision(&self) -> Result<(), OrchestratorError> {
        let Some(provisioner) = &self.provisioner else {
            return Ok(());
        };
        provisioner.provision().await.map_err(|e| {
            error!("Failed to provision shared resources: {}", e);
            OrchestratorError::Provisioning(e)
        })
    }

    async fn start_service(
        &self,
        name: &str,
        progress: &Option<ProgressSender>,
    ) -> Result<(), OrchestratorError> {
        let descriptor = self
            .table
            .get(name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))?;

        if descriptor.status.is_running() && descriptor.container.is_some() {
            debug!("Service {} is already running", name);
            return Ok(());
        }

        let (starter, healthcheck) = {
            let registered = self
                .services
                .get(name)
                .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))?;
            (registered.starter.clone(), registered.healthcheck.clone())
        };

        self.table.update(name, |d| {
            d.desired_state = DesiredState::Starting;
            d.status = ServiceStatus::Starting;
        })?;
        emit(progress, name, ServicePhase::Starting).await;
        info!("Starting service {}", name);

        if let Some(old) = &descriptor.container {
            if let Err(e) = self.runtime.remove(old).await {
                warn!("Removing old container {} for {} failed: {}", old, name, e);
            }
        }

        match starter.start().await {
            Ok(container) => {
                self.table.update(name, |d| {
                    d.container = Some(container.clone());
                    d.desired_state = DesiredState::Running;
                    d.status = ServiceStatus::Running;
                    d.last_error = None;
                })?;
                self.engine.reset_attempts(name);

                self.health
                    .register_service(name, container.clone(), healthcheck.unwrap_or_default());
                let action = Arc::new(OrchestratedRestart {
                    replace: ReplaceContainer::new(self.runtime.clone(), starter),
                    health: self.health.clone(),
                });
                self.watcher.watch(name, container, action);

                emit(progress, name, ServicePhase::Started).await;
                info!("Service {} started", name);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start {}: {}", name, e);
                let message = e.to_string();
                self.table.update(name, |d| {
                    d.desired_state = DesiredState::Stopped;
                    d.status = ServiceStatus::Failed;
                    d.last_error = Some(message.clone());
                })?;
                emit(progress, name, ServicePhase::Failed { message }).await;
                Err(OrchestratorError::StartFailed {
                    service: name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Stop every started service in exact reverse start order.
    ///
    /// A failed stop does not prevent the remaining stops; the last failure is returned.
    pub async fn stop_all(&self, progress: Option<ProgressSender>) -> Result<(), OrchestratorError> {
        let order = get_stop_order(&self.table.snapshot())?;

        let mut last_error = None;
        for name in order {
            if let Err(e) = self.stop_service(&name, &progress).await {
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop one service by name or alias.
    pub async fn stop_selected(
        &self,
        name: &str,
        progress: Option<ProgressSender>,
    ) -> Result<(), OrchestratorError> {
        let name = self.resolve(name)?;
        self.stop_service(&name, &progress).await
    }

    async fn stop_service(
        &self,
        name: &str,
        progress: &Option<ProgressSender>,
    ) -> Result<(), OrchestratorError> {
        let descriptor = self
            .table
            .get(name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))?;

        let container = match descriptor.container {
            Some(container) if descriptor.status != ServiceStatus::Stopped => container,
            _ => {
                self.table.set_desired_state(name, DesiredState::Stopped)?;
                return Ok(());
            }
        };

        // Mark first so an exit observed from here on is not restarted
        self.table.update(name, |d| {
            d.desired_state = DesiredState::Stopping;
            d.status = ServiceStatus::Stopping;
        })?;
        emit(progress, name, ServicePhase::Stopping).await;
        info!("Stopping service {}", name);

        self.watcher.unwatch(name);
        self.health.unregister_service(name);

        // A restart may have swapped the container while we were marking
        let container = self
            .table
            .get(name)
            .and_then(|d| d.container)
            .unwrap_or(container);

        match self.runtime.stop(&container).await {
            Ok(()) => {
                self.table.update(name, |d| {
                    d.desired_state = DesiredState::Stopped;
                    d.status = ServiceStatus::Stopped;
                })?;
                emit(progress, name, ServicePhase::Stopped).await;
                info!("Service {} stopped", name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to stop {}: {}", name, e);
                let message = e.to_string();
                self.table.update(name, |d| {
                    d.status = ServiceStatus::Failed;
                    d.last_error = Some(message.clone());
                })?;
                emit(progress, name, ServicePhase::Failed { message }).await;
                Err(OrchestratorError::StopFailed {
                    service: name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Cancel all watchers and health checks. Containers keep running.
    pub fn shutdown(&self) {
        self.token.cancel();
        self.watcher.shutdown();
        self.health.stop();
        info!("Orchestrator shut down");
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_status(&self) -> HashMap<String, HealthStatus> {
        self.health.get_status()
    }

    pub fn get_restart_status(&self) -> HashMap<String, RestartStatus> {
        self.engine.status()
    }

    /// All service descriptors in registration order.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.table.snapshot()
    }

    pub fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        self.table.get(name)
    }

    pub fn alerts(&self) -> AlertReceiver {
        self.alerts.receiver()
    }

    pub fn alert_bus(&self) -> &AlertBus {
        &self.alerts
    }

    pub fn restart_engine(&self) -> &Arc<RestartPolicyEngine> {
        &self.engine
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn watcher(&self) -> &Arc<ServiceWatcher> {
        &self.watcher
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests;
