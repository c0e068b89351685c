//! Service descriptors shared by the orchestrator and the watchers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::errors::{LifecycleError, Result};
use crate::runtime::ContainerRef;

/// What the operator wants a service to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DesiredState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl DesiredState {
    /// Automatic restarts are suppressed while the operator is stopping or has stopped the service.
    pub fn allows_restart(&self) -> bool {
        !matches!(self, DesiredState::Stopping | DesiredState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Stopped => "stopped",
            DesiredState::Starting => "starting",
            DesiredState::Running => "running",
            DesiredState::Stopping => "stopping",
        }
    }
}

/// Observed lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::Failed => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Restarting)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub kind: String,
    pub depends_on: Vec<String>,
    pub container: Option<ContainerRef>,
    pub desired_state: DesiredState,
    pub status: ServiceStatus,
    pub registration_index: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            depends_on,
            container: None,
            desired_state: DesiredState::Stopped,
            status: ServiceStatus::Stopped,
            registration_index: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Concurrent table of service descriptors, keyed by name.
#[derive(Debug, Default)]
pub struct ServiceTable {
    services: DashMap<String, ServiceDescriptor>,
    next_index: AtomicU64,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor, stamping its registration index.
    pub fn insert(&self, mut descriptor: ServiceDescriptor) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.services.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(LifecycleError::DuplicateService(descriptor.name)),
            Entry::Vacant(slot) => {
                descriptor.registration_index = self.next_index.fetch_add(1, Ordering::Relaxed);
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<ServiceDescriptor> {
        self.services.remove(name).map(|(_, d)| d)
    }

    pub fn get(&self, name: &str) -> Option<ServiceDescriptor> {
        self.services.get(name).map(|d| d.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn desired_state(&self, name: &str) -> Option<DesiredState> {
        self.services.get(name).map(|d| d.desired_state)
    }

    /// Apply `f` to the descriptor under its entry lock.
    pub fn update<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceDescriptor),
    {
        let mut entry = self
            .services
            .get_mut(name)
            .ok_or_else(|| LifecycleError::ServiceNotFound(name.to_string()))?;
        f(&mut *entry);
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_desired_state(&self, name: &str, state: DesiredState) -> Result<()> {
        self.update(name, |d| d.desired_state = state)
    }

    pub fn set_status(&self, name: &str, status: ServiceStatus) -> Result<()> {
        self.update(name, |d| d.status = status)
    }

    pub fn set_container(&self, name: &str, container: ContainerRef) -> Result<()> {
        self.update(name, |d| d.container = Some(container))
    }

    /// All descriptors ordered by registration.
    pub fn snapshot(&self) -> Vec<ServiceDescriptor> {
        let mut all: Vec<_> = self.services.iter().map(|d| d.value().clone()).collect();
        all.sort_by_key(|d| d.registration_index);
        all
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
