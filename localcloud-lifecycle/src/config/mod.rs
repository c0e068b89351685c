//! Configuration types for the lifecycle subsystem.
//!
//! Loading the project file is the host's job; this module only turns a YAML
//! document into typed values and validates them.

mod duration;
mod health;
mod restart;

pub use duration::{
    deserialize_duration, deserialize_duration_list, format_duration, parse_duration,
    serialize_duration, serialize_duration_list,
};
pub use health::{HealthCheckConfig, ResourceThresholds};
pub use restart::{default_backoff, RestartConfig, RestartMode, DEFAULT_BACKOFF_SECS};

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::errors::{LifecycleError, Result};

/// Default alert bus capacity
pub const DEFAULT_ALERT_CAPACITY: usize = 100;

/// Top-level lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
    #[serde(
        default = "default_system_check_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub system_check_interval: Duration,
    #[serde(default)]
    pub thresholds: ResourceThresholds,
    /// Services in declaration order.
    #[serde(default, deserialize_with = "deserialize_services")]
    pub services: Vec<NamedService>,
    /// Extra alias -> canonical service name mappings.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            alert_capacity: default_alert_capacity(),
            system_check_interval: default_system_check_interval(),
            thresholds: ResourceThresholds::default(),
            services: Vec::new(),
            aliases: HashMap::new(),
        }
    }
}

fn default_alert_capacity() -> usize {
    DEFAULT_ALERT_CAPACITY
}

fn default_system_check_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedService {
    pub name: String,
    #[serde(flatten)]
    pub config: ServiceConfig,
}

/// Per-service configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Starter kind; defaults to the service name.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckConfig>,
}

fn deserialize_services<'de, D>(deserializer: D) -> std::result::Result<Vec<NamedService>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
    mapping
        .into_iter()
        .map(|(key, value)| {
            let name = key
                .as_str()
                .ok_or_else(|| serde::de::Error::custom("service names must be strings"))?
                .to_string();
            let config = if value.is_null() {
                ServiceConfig::default()
            } else {
                serde_yaml::from_value(value).map_err(serde::de::Error::custom)?
            };
            Ok(NamedService { name, config })
        })
        .collect()
}

impl LifecycleConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let config: LifecycleConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.alert_capacity == 0 {
            return Err(LifecycleError::Config(
                "alert_capacity must be at least 1".to_string(),
            ));
        }
        if self.system_check_interval.is_zero() {
            return Err(LifecycleError::Config(
                "system_check_interval must be non-zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(LifecycleError::DuplicateService(service.name.clone()));
            }
        }

        for service in &self.services {
            for dep in &service.config.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(LifecycleError::MissingDependency {
                        service: service.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if let Some(hc) = &service.config.healthcheck {
                if hc.failure_threshold == 0 {
                    return Err(LifecycleError::Config(format!(
                        "service {}: healthcheck failure_threshold must be at least 1",
                        service.name
                    )));
                }
                if hc.interval.is_zero() {
                    return Err(LifecycleError::Config(format!(
                        "service {}: healthcheck interval must be non-zero",
                        service.name
                    )));
                }
                if hc.timeout.is_zero() {
                    return Err(LifecycleError::Config(format!(
                        "service {}: healthcheck timeout must be non-zero",
                        service.name
                    )));
                }
            }
        }

        for (alias, target) in &self.aliases {
            if !names.contains(target.as_str()) {
                return Err(LifecycleError::Config(format!(
                    "alias '{}' points to unknown service '{}'",
                    alias, target
                )));
            }
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.config)
    }
}

impl ServiceConfig {
    pub fn kind_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(name)
    }
}
