//! Error types for service orchestration

use crate::errors::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Unknown service or alias: {0}")]
    UnknownService(String),

    #[error("Failed to provision shared resources: {0}")]
    Provisioning(#[source] RuntimeError),

    #[error("Failed to start {service}: {source}")]
    StartFailed {
        service: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to stop {service}: {source}")]
    StopFailed {
        service: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::errors::LifecycleError),
}
