use thiserror::Error;

/// Failure reported by a container runtime collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Runtime operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Failure of a single health probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("{0}")]
    Failed(String),

    #[error("health check timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service already registered: {0}")]
    DuplicateService(String),

    #[error("No starter registered for service kind '{kind}' (service {service})")]
    UnknownServiceKind { service: String, kind: String },

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Missing dependency for service {service}: {dependency}")]
    MissingDependency { service: String, dependency: String },

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
