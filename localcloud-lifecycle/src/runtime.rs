//! Collaborator interfaces consumed by the lifecycle subsystem.
//!
//! Container operations, service-kind specific starters, probes and shared
//! resource provisioning all live outside this crate and are injected through
//! the traits below.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{ProbeError, RuntimeError};

/// Opaque handle for a running container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef(String);

impl ContainerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContainerRef {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspect {
    pub running: bool,
    /// Health reported by the container's own healthcheck, if it has one.
    pub health: Option<String>,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub mem_usage: u64,
    pub mem_limit: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve when the container exits, yielding its exit code.
    async fn wait_exit(&self, container: &ContainerRef) -> Result<i64, RuntimeError>;
    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError>;
    async fn stop(&self, container: &ContainerRef) -> Result<(), RuntimeError>;
    async fn remove(&self, container: &ContainerRef) -> Result<(), RuntimeError>;
    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerInspect, RuntimeError>;
    async fn stats(&self, container: &ContainerRef) -> Result<ResourceSnapshot, RuntimeError>;
}

/// Creates and starts the container for one kind of service.
#[async_trait]
pub trait ServiceStarter: Send + Sync {
    async fn start(&self) -> Result<ContainerRef, RuntimeError>;
}

/// A single health probe against a container.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, container: &ContainerRef) -> Result<(), ProbeError>;
}

/// Provisions resources shared by all services, such as the project network.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> Result<(), RuntimeError>;
}

/// Default probe: the container must be running and, if it reports its own
/// health, that health must be `healthy`.
pub struct InspectProbe {
    runtime: Arc<dyn ContainerRuntime>,
}

impl InspectProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Probe for InspectProbe {
    async fn check(&self, container: &ContainerRef) -> Result<(), ProbeError> {
        let inspect = self.runtime.inspect(container).await?;
        if !inspect.running {
            return Err(ProbeError::Failed("container not running".to_string()));
        }
        match inspect.health.as_deref() {
            Some(status) if status != "healthy" => Err(ProbeError::Failed(format!(
                "container health status: {}",
                status
            ))),
            _ => Ok(()),
        }
    }
}

/// Probe backed by a closure.
pub struct FnProbe<F> {
    f: F,
}

/// Build a [`Probe`] from an async closure taking the container reference.
pub fn probe_fn<F, Fut>(f: F) -> FnProbe<F>
where
    F: Fn(ContainerRef) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProbeError>> + Send + 'static,
{
    FnProbe { f }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn(ContainerRef) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProbeError>> + Send + 'static,
{
    async fn check(&self, container: &ContainerRef) -> Result<(), ProbeError> {
        (self.f)(container.clone()).await
    }
}

/// Starter backed by a closure.
pub struct FnStarter<F> {
    f: F,
}

pub fn starter_fn<F, Fut>(f: F) -> FnStarter<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContainerRef, RuntimeError>> + Send + 'static,
{
    FnStarter { f }
}

#[async_trait]
impl<F, Fut> ServiceStarter for FnStarter<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContainerRef, RuntimeError>> + Send + 'static,
{
    async fn start(&self) -> Result<ContainerRef, RuntimeError> {
        (self.f)().await
    }
}
